/// Agent 接入令牌
///
/// 将隧道 ID、隧道密钥和服务器地址打包为一个字符串（JSON + base64），
/// 便于管理端一次性下发给内网 agent。
use crate::error::{Result, TunnelError};
use base64::Engine;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentToken {
    /// 隧道 ID
    pub tunnel_id: String,
    /// 隧道密钥（同时作为加密密钥）
    pub token: String,
    /// 服务器地址
    pub server: String,
}

impl AgentToken {
    pub fn new(
        tunnel_id: impl Into<String>,
        token: impl Into<String>,
        server: impl Into<String>,
    ) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            token: token.into(),
            server: server.into(),
        }
    }

    /// 编码为令牌字符串
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self).map_err(|e| TunnelError::Other(e.into()))?;
        Ok(base64::engine::general_purpose::STANDARD.encode(json))
    }

    /// 从令牌字符串解析
    pub fn decode(encoded: &str) -> Result<Self> {
        let json = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| TunnelError::config(format!("invalid agent token encoding: {}", e)))?;
        serde_json::from_slice(&json)
            .map_err(|e| TunnelError::config(format!("invalid agent token content: {}", e)))
    }
}
