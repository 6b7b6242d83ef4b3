use anyhow::{bail, Result};
use std::collections::HashSet;
use tracing::warn;

use super::{AgentConfig, ServerConfig, ServerFullConfig, TunnelSeed};
use crate::crypto;
use crate::protocol::LENGTH_PREFIX_SIZE;
use crate::store::Route;

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证隧道密钥长度（AES-128/192/256）
    pub fn validate_token(token: &str, context: &str) -> Result<()> {
        if crypto::validate_key(token.as_bytes()).is_err() {
            bail!(
                "{}: token must be 16, 24 or 32 bytes long (current length: {})",
                context,
                token.len()
            );
        }
        Ok(())
    }

    /// 验证端口号
    pub fn validate_port(port: u16, context: &str) -> Result<()> {
        if port == 0 {
            bail!("{}: port cannot be 0", context);
        }
        Ok(())
    }

    /// 验证地址不为空
    pub fn validate_address(addr: &str, context: &str) -> Result<()> {
        if addr.trim().is_empty() {
            bail!("{}: address cannot be empty", context);
        }
        Ok(())
    }

    /// 验证名称不为空
    pub fn validate_name(name: &str, context: &str) -> Result<()> {
        if name.trim().is_empty() {
            bail!("{}: name cannot be empty", context);
        }
        Ok(())
    }

    /// 验证 `host:port` 形式的地址
    pub fn validate_host_port(addr: &str, context: &str) -> Result<()> {
        Self::validate_address(addr, context)?;
        match addr.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => match port.parse::<u16>() {
                Ok(port) => Self::validate_port(port, context),
                Err(_) => bail!("{}: invalid port in '{}'", context, addr),
            },
            _ => bail!("{}: '{}' must be in host:port form", context, addr),
        }
    }

    /// 验证服务器配置
    pub fn validate_server_config(config: &ServerConfig) -> Result<()> {
        Self::validate_address(&config.bind_addr, "Server bind_addr")?;

        if config.max_frame_size <= LENGTH_PREFIX_SIZE || config.max_frame_size > u32::MAX as usize
        {
            bail!(
                "max_frame_size must be between {} and {} bytes",
                LENGTH_PREFIX_SIZE + 1,
                u32::MAX
            );
        }
        if config.channel_capacity == 0 {
            bail!("channel_capacity must be greater than 0");
        }
        if config.max_header_size == 0 {
            bail!("max_header_size must be greater than 0");
        }
        if config.handshake_timeout_secs == 0 {
            bail!("handshake_timeout_secs must be greater than 0");
        }
        if config.max_header_size > config.max_frame_size {
            warn!(
                "max_header_size ({}) is larger than max_frame_size ({}), \
                 oversized request headers cannot be forwarded",
                config.max_header_size, config.max_frame_size
            );
        }

        Ok(())
    }

    /// 验证隧道种子列表
    pub fn validate_tunnels(tunnels: &[TunnelSeed]) -> Result<()> {
        let mut seen_ids = HashSet::new();

        for tunnel in tunnels {
            Self::validate_name(&tunnel.id, "Tunnel id")?;
            Self::validate_name(&tunnel.name, &format!("Tunnel '{}'", tunnel.id))?;

            if !seen_ids.insert(&tunnel.id) {
                bail!(
                    "Duplicate tunnel id '{}': each tunnel must have a unique id",
                    tunnel.id
                );
            }

            Self::validate_token(&tunnel.token, &format!("Tunnel '{}'", tunnel.id))?;
        }

        Ok(())
    }

    /// 验证路由列表（引用的隧道必须存在）
    pub fn validate_routes(routes: &[Route], tunnels: &[TunnelSeed]) -> Result<()> {
        let tunnel_ids: HashSet<&str> = tunnels.iter().map(|t| t.id.as_str()).collect();
        let mut seen_ids = HashSet::new();
        let mut seen_hosts = HashSet::new();

        for route in routes {
            Self::validate_name(&route.id, "Route id")?;

            if !seen_ids.insert(&route.id) {
                bail!(
                    "Duplicate route id '{}': each route must have a unique id",
                    route.id
                );
            }

            if !tunnel_ids.contains(route.tunnel_id.as_str()) {
                bail!(
                    "Route '{}' references unknown tunnel '{}'",
                    route.id,
                    route.tunnel_id
                );
            }

            Self::validate_name(&route.hostname, &format!("Route '{}' hostname", route.id))?;
            Self::validate_address(&route.target, &format!("Route '{}' target", route.id))?;

            // 先出现的规则生效，重复的主机名永远不会被匹配到
            if !seen_hosts.insert(route.hostname.to_ascii_lowercase()) {
                warn!(
                    "Route '{}' hostname '{}' is shadowed by an earlier route",
                    route.id, route.hostname
                );
            }
        }

        Ok(())
    }

    /// 验证服务器完整配置
    pub fn validate_server_full_config(config: &ServerFullConfig) -> Result<()> {
        Self::validate_server_config(&config.server)?;
        Self::validate_tunnels(&config.tunnels)?;
        Self::validate_routes(&config.routes, &config.tunnels)?;

        if config.tunnels.is_empty() {
            warn!("No tunnels defined, every agent handshake will be rejected");
        }

        Ok(())
    }

    /// 验证 agent 配置
    pub fn validate_agent_config(config: &AgentConfig) -> Result<()> {
        Self::validate_host_port(&config.server_addr, "Agent server_addr")?;
        Self::validate_name(&config.tunnel_id, "Agent tunnel_id")?;
        Self::validate_token(&config.token, "Agent")?;

        if config.heartbeat_interval_secs == 0 {
            bail!("heartbeat_interval_secs must be greater than 0");
        }
        if config.heartbeat_timeout_secs == 0 {
            bail!("heartbeat_timeout_secs must be greater than 0");
        }
        if config.reconnect_interval_secs == 0 {
            bail!("reconnect_interval_secs must be greater than 0");
        }
        if config.connect_timeout_secs == 0 {
            bail!("connect_timeout_secs must be greater than 0");
        }
        if config.channel_capacity == 0 {
            bail!("channel_capacity must be greater than 0");
        }

        Ok(())
    }
}
