use anyhow::{bail, Context, Result};
use tracing::info;

use crate::agent;
use crate::config::{AgentConfig, AppConfig, ConfigValidator};
use crate::server;
use crate::token::AgentToken;

use super::config::{check_config, check_config_file_permissions, expand_path};
use super::template;

/// Execute CLI commands
pub async fn execute_command(cli: &super::Cli) -> Result<()> {
    use super::Commands;

    match &cli.command {
        Commands::Check { config, format } => {
            let config_path = expand_path(config)?;
            check_config(&config_path, format)?;
        }
        Commands::Template {
            template_type,
            output,
        } => {
            template::generate_config_template(template_type, output.as_deref())?;
        }
        Commands::Token {
            tunnel_id,
            secret,
            server,
        } => {
            println!("{}", mint_token(tunnel_id, secret, server)?);
        }
        Commands::Server { config } => {
            run_server(config).await?;
        }
        Commands::Agent { config, token } => {
            run_agent(config.as_deref(), token.as_deref()).await?;
        }
    }

    Ok(())
}

/// 生成接入令牌
pub fn mint_token(tunnel_id: &str, secret: &str, server: &str) -> Result<String> {
    ConfigValidator::validate_name(tunnel_id, "tunnel_id")?;
    ConfigValidator::validate_token(secret, "secret")?;
    ConfigValidator::validate_host_port(server, "server")?;

    let token = AgentToken::new(tunnel_id, secret, server)
        .encode()
        .context("Failed to encode agent token")?;
    Ok(token)
}

/// Run tunnel relay server
async fn run_server(config: &str) -> Result<()> {
    let config_path = expand_path(config)?;

    // 检查配置文件权限
    check_config_file_permissions(&config_path)?;

    info!("Loading server configuration from: {}", config_path);
    let server_config = AppConfig::load_server_config(&config_path)?;

    server::run_server(server_config, Some(config_path)).await
}

/// Run agent
async fn run_agent(config: Option<&str>, token: Option<&str>) -> Result<()> {
    let agent_config = match (config, token) {
        (_, Some(token)) => {
            let token = AgentToken::decode(token).context("Invalid agent token")?;
            let config = AgentConfig::from_token(&token);
            config
                .validate()
                .context("Agent token carries an invalid configuration")?;
            config
        }
        (Some(config), None) => {
            let config_path = expand_path(config)?;
            check_config_file_permissions(&config_path)?;
            info!("Loading agent configuration from: {}", config_path);
            AppConfig::load_agent_config(&config_path)?
        }
        (None, None) => bail!("Either --config or --token is required"),
    };

    agent::run_agent(agent_config).await
}
