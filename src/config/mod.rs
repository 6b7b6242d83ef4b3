// 配置管理模块

mod validator;

pub use validator::ConfigValidator;

use crate::agent::SessionTiming;
use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
use crate::server::ServerOptions;
use crate::store::{Route, Tunnel};
use crate::token::AgentToken;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_bind_port() -> u16 {
    5429
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_channel_capacity() -> usize {
    256
}

fn default_max_header_size() -> usize {
    16 * 1024
}

fn default_heartbeat_interval_secs() -> u64 {
    10
}

fn default_heartbeat_timeout_secs() -> u64 {
    10
}

fn default_reconnect_attempts() -> u32 {
    3
}

fn default_reconnect_interval_secs() -> u64 {
    6
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

/// 服务器端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 服务器监听地址
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// 服务器监听端口（agent 与访客共用）
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
    /// 单帧最大长度（字节）
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// 每个连接写通道的容量
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// 等待完整 HTTP 请求头的最大字节数
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    /// 新连接发出首帧或完整请求头的期限（秒）
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            bind_port: default_bind_port(),
            max_frame_size: default_max_frame_size(),
            channel_capacity: default_channel_capacity(),
            max_header_size: default_max_header_size(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
        }
    }
}

impl ServerConfig {
    /// 监听地址
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.bind_port)
    }

    /// 运行时参数
    pub fn options(&self) -> ServerOptions {
        ServerOptions {
            max_frame_size: self.max_frame_size,
            channel_capacity: self.channel_capacity,
            max_header_size: self.max_header_size,
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_server_config(self)
    }
}

/// 配置文件中的隧道种子数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSeed {
    pub id: String,
    pub name: String,
    /// 共享密钥（16/24/32 字节）
    pub token: String,
}

impl From<TunnelSeed> for Tunnel {
    fn from(seed: TunnelSeed) -> Self {
        Tunnel::new(seed.id, seed.name, seed.token)
    }
}

/// 服务器完整配置（包含隧道和路由种子数据）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerFullConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub tunnels: Vec<TunnelSeed>,
    #[serde(default)]
    pub routes: Vec<Route>,
}

impl ServerFullConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_server_full_config(self)
    }
}

/// Agent 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// 服务器地址（host:port）
    pub server_addr: String,
    /// 隧道 ID
    pub tunnel_id: String,
    /// 隧道密钥（同时作为加密密钥）
    pub token: String,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    /// 断线后的重连次数
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// 拨号和握手超时
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl AgentConfig {
    pub fn new(
        server_addr: impl Into<String>,
        tunnel_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            server_addr: server_addr.into(),
            tunnel_id: tunnel_id.into(),
            token: token.into(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_interval_secs: default_reconnect_interval_secs(),
            channel_capacity: default_channel_capacity(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }

    /// 由接入令牌生成（其余参数取默认值）
    pub fn from_token(token: &AgentToken) -> Self {
        Self::new(&token.server, &token.tunnel_id, &token.token)
    }

    /// 会话时序参数
    pub fn timing(&self) -> SessionTiming {
        SessionTiming {
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
            reconnect_attempts: self.reconnect_attempts,
            reconnect_interval: Duration::from_secs(self.reconnect_interval_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_agent_config(self)
    }
}

/// 应用配置
#[derive(Debug, Clone)]
pub enum AppConfig {
    Server(ServerFullConfig),
    Agent(AgentConfig),
}

/// 展开路径中的 `~`
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

fn read_config_file(path: &str) -> anyhow::Result<String> {
    let path = expand_path(path);
    std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read configuration file {}", path.display()))
}

impl AppConfig {
    /// 从文件加载配置（按顶层表自动识别类型）
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = read_config_file(path)?;
        Self::parse(&content)
    }

    /// 从字符串解析配置（按顶层表自动识别类型）
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let value: toml::Table = toml::from_str(content).context("Failed to parse configuration")?;

        if value.contains_key("server") {
            let config = Self::parse_server_config(content)?;
            Ok(AppConfig::Server(config))
        } else if value.contains_key("agent") {
            let config = Self::parse_agent_config(content)?;
            Ok(AppConfig::Agent(config))
        } else {
            anyhow::bail!("Configuration must contain a [server] or [agent] table")
        }
    }

    /// 从文件加载服务器配置
    pub fn load_server_config(path: &str) -> anyhow::Result<ServerFullConfig> {
        let content = read_config_file(path)?;
        Self::parse_server_config(&content)
    }

    /// 从文件加载 agent 配置
    pub fn load_agent_config(path: &str) -> anyhow::Result<AgentConfig> {
        let content = read_config_file(path)?;
        Self::parse_agent_config(&content)
    }

    fn parse_server_config(content: &str) -> anyhow::Result<ServerFullConfig> {
        let config: ServerFullConfig =
            toml::from_str(content).context("Failed to parse server configuration")?;
        config
            .validate()
            .context("Server configuration validation failed")?;
        Ok(config)
    }

    fn parse_agent_config(content: &str) -> anyhow::Result<AgentConfig> {
        #[derive(Deserialize)]
        struct AgentConfigWrapper {
            agent: AgentConfig,
        }

        let wrapper: AgentConfigWrapper =
            toml::from_str(content).context("Failed to parse agent configuration")?;
        wrapper
            .agent
            .validate()
            .context("Agent configuration validation failed")?;
        Ok(wrapper.agent)
    }
}
