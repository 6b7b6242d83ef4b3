use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;

use crate::config::{self, AgentConfig, AppConfig, ServerFullConfig};

/// 检查配置文件权限（仅Unix系统）
#[cfg(unix)]
pub fn check_config_file_permissions(config_path: &str) -> Result<()> {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tracing::warn;

    let metadata = fs::metadata(config_path)
        .with_context(|| format!("Failed to read metadata for config file: {}", config_path))?;
    let mode = metadata.permissions().mode();

    // 其他用户或组用户可读（o+r = 0o004, g+r = 0o040）
    if mode & 0o044 != 0 {
        warn!(
            "Config file '{}' is readable by other users (permissions: {:o}). \
             It contains tunnel tokens, consider: chmod 600 {}",
            config_path,
            mode & 0o777,
            config_path
        );
    }

    Ok(())
}

/// Windows系统不进行权限检查
#[cfg(not(unix))]
pub fn check_config_file_permissions(_config_path: &str) -> Result<()> {
    Ok(())
}

#[derive(Serialize)]
struct CheckResult {
    valid: bool,
    config_type: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    details: serde_json::Value,
}

/// Expand path with tilde (~) and make it absolute
pub fn expand_path(path: &str) -> Result<String> {
    let path_buf = config::expand_path(path);

    let absolute = if path_buf.is_absolute() {
        path_buf
    } else {
        std::env::current_dir()
            .context("Failed to get current directory")?
            .join(&path_buf)
    };

    absolute
        .to_str()
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("Invalid path: {}", path))
}

fn server_details(config: &ServerFullConfig) -> (serde_json::Value, Vec<String>) {
    let mut warnings = Vec::new();
    if config.tunnels.is_empty() {
        warnings.push("No tunnels defined".to_string());
    }
    if config.routes.is_empty() {
        warnings.push("No routes defined".to_string());
    }

    let routes: Vec<_> = config
        .routes
        .iter()
        .map(|route| {
            serde_json::json!({
                "id": route.id,
                "hostname": route.hostname,
                "protocol": route.protocol,
                "tunnel_id": route.tunnel_id,
                "target": route.target,
            })
        })
        .collect();

    let details = serde_json::json!({
        "listen_addr": config.server.listen_addr(),
        "max_frame_size": config.server.max_frame_size,
        "max_header_size": config.server.max_header_size,
        "handshake_timeout_secs": config.server.handshake_timeout_secs,
        "tunnels_count": config.tunnels.len(),
        "routes": routes,
    });
    (details, warnings)
}

fn agent_details(config: &AgentConfig) -> serde_json::Value {
    serde_json::json!({
        "server_addr": config.server_addr,
        "tunnel_id": config.tunnel_id,
        "token_length": config.token.len(),
        "heartbeat_interval_secs": config.heartbeat_interval_secs,
        "heartbeat_timeout_secs": config.heartbeat_timeout_secs,
        "reconnect_attempts": config.reconnect_attempts,
        "reconnect_interval_secs": config.reconnect_interval_secs,
    })
}

fn print_json(result: &CheckResult) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(result)?);
    Ok(())
}

/// Check configuration file format
pub fn check_config(config_path: &str, format: &str) -> Result<()> {
    if !Path::new(config_path).exists() {
        if format == "json" {
            print_json(&CheckResult {
                valid: false,
                config_type: "unknown".to_string(),
                warnings: vec![],
                error: Some(format!("Configuration file not found: {}", config_path)),
                details: serde_json::json!({}),
            })?;
        } else {
            println!("✗ Configuration file not found: {}", config_path);
        }
        anyhow::bail!("Configuration file not found: {}", config_path);
    }

    if format == "text" {
        println!("Checking configuration file: {}\n", config_path);
    }

    match AppConfig::from_file(config_path) {
        Ok(AppConfig::Server(server_config)) => {
            let (details, warnings) = server_details(&server_config);
            if format == "json" {
                print_json(&CheckResult {
                    valid: true,
                    config_type: "server".to_string(),
                    warnings,
                    error: None,
                    details,
                })?;
            } else {
                println!("✓ Configuration type: Server");
                println!("✓ Listen address: {}", server_config.server.listen_addr());
                println!("✓ Tunnels: {}", server_config.tunnels.len());
                println!("✓ Routes: {}", server_config.routes.len());
                for (idx, route) in server_config.routes.iter().enumerate() {
                    println!(
                        "  Route #{}: {} ({}) -> tunnel '{}' -> {}",
                        idx + 1,
                        route.hostname,
                        route.protocol,
                        route.tunnel_id,
                        route.target
                    );
                }
                for warning in &warnings {
                    println!("⚠ Warning: {}", warning);
                }
                println!("\n✓ Server configuration is valid!");
            }
            Ok(())
        }
        Ok(AppConfig::Agent(agent_config)) => {
            if format == "json" {
                print_json(&CheckResult {
                    valid: true,
                    config_type: "agent".to_string(),
                    warnings: vec![],
                    error: None,
                    details: agent_details(&agent_config),
                })?;
            } else {
                println!("✓ Configuration type: Agent");
                println!("✓ Server address: {}", agent_config.server_addr);
                println!("✓ Tunnel id: {}", agent_config.tunnel_id);
                println!("✓ Token: {} bytes", agent_config.token.len());
                println!(
                    "✓ Heartbeat: every {}s, timeout {}s",
                    agent_config.heartbeat_interval_secs, agent_config.heartbeat_timeout_secs
                );
                println!(
                    "✓ Reconnect: {} attempt(s), {}s apart",
                    agent_config.reconnect_attempts, agent_config.reconnect_interval_secs
                );
                println!("\n✓ Agent configuration is valid!");
            }
            Ok(())
        }
        Err(e) => {
            if format == "json" {
                print_json(&CheckResult {
                    valid: false,
                    config_type: "unknown".to_string(),
                    warnings: vec![],
                    error: Some(format!("{:#}", e)),
                    details: serde_json::json!({}),
                })?;
            } else {
                println!("✗ Configuration validation failed!");
                println!("\nError details:");
                println!("{:#}", e);

                println!("\nCommon issues:");
                println!("  1. Check TOML syntax (brackets, quotes, commas)");
                println!("  2. Ensure all required fields are present");
                println!("  3. Tokens must be exactly 16, 24 or 32 bytes");
                println!("  4. Every route's tunnel_id must match a [[tunnels]] entry");
                println!("  5. For server config: [server] section plus [[tunnels]] and [[routes]]");
                println!("  6. For agent config: [agent] section with server_addr, tunnel_id and token");
            }

            Err(e)
        }
    }
}
