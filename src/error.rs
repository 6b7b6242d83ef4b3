/// 自定义错误类型
///
/// 使用 thiserror 定义精确的错误类型，调用者可以据此区分
/// "不是协议消息"、"加解密失败"、"路由不存在" 等不同情况
use std::io;
use thiserror::Error;

/// 隧道核心的主要错误类型
#[derive(Error, Debug)]
pub enum TunnelError {
    /// 消息帧格式错误（也用于区分协议消息和原始字节）
    #[error("Malformed envelope: {0}")]
    Decode(String),

    /// 密钥长度不是 16/24/32 字节
    #[error("Invalid key size: {0} bytes (expected 16, 24 or 32)")]
    InvalidKeySize(usize),

    /// 解密认证失败
    #[error("authentication failed or message altered")]
    Auth,

    /// 隧道或路由未找到
    #[error("Not found: {0}")]
    NotFound(String),

    /// 连接失败
    #[error("Failed to connect to {addr}: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 重连次数耗尽
    #[error("Reconnect failed after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// 写入失败（通道已关闭或 socket 错误）
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// 服务器拒绝握手
    #[error("Rejected by server: {0}")]
    Rejected(String),

    /// 超时错误
    #[error("Operation timeout after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    /// 创建帧解析错误
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// 创建未找到错误
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// 创建连接失败错误
    pub fn connect_failed(addr: impl Into<String>, source: io::Error) -> Self {
        Self::ConnectFailed {
            addr: addr.into(),
            source,
        }
    }

    /// 创建写入失败错误
    pub fn write_failed(msg: impl Into<String>) -> Self {
        Self::WriteFailed(msg.into())
    }

    /// 创建配置错误
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// 创建超时错误
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout { duration }
    }

    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// 会话层是否应该通过重连来恢复
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectFailed { .. } | Self::WriteFailed(_) | Self::Timeout { .. } | Self::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_auth_error_message() {
        let err = TunnelError::Auth;
        assert!(err.is_auth());
        assert_eq!(err.to_string(), "authentication failed or message altered");
    }

    #[test]
    fn test_invalid_key_size() {
        let err = TunnelError::InvalidKeySize(7);
        assert!(err.to_string().contains("7 bytes"));
    }

    #[test]
    fn test_connect_failed() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err = TunnelError::connect_failed("127.0.0.1:5429", io_err);
        assert!(err.to_string().contains("Failed to connect"));
        assert!(err.to_string().contains("127.0.0.1:5429"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_error_is_checks() {
        let decode = TunnelError::decode("truncated");
        let not_found = TunnelError::not_found("route a.example.com");
        let timeout = TunnelError::timeout(Duration::from_secs(1));

        assert!(decode.is_decode());
        assert!(!decode.is_retryable());
        assert!(not_found.is_not_found());
        assert!(!not_found.is_auth());
        assert!(timeout.is_timeout());
        assert!(timeout.is_retryable());
        assert!(!TunnelError::Rejected("unknown tunnel".into()).is_retryable());
    }
}
