/// Tunnel Relay 库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod agent;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod server;
pub mod store;
pub mod token;

// 重新导出常用类型
pub use agent::{AgentSession, SessionState, SessionTiming};
pub use config::{AgentConfig, AppConfig, ServerConfig, ServerFullConfig};
pub use error::{Result, TunnelError};
pub use protocol::{Envelope, EnvelopeCodec, MessageKind, Protocol};
pub use server::{Server, ServerOptions};
pub use store::{MemoryStore, Route, Tunnel, TunnelStatus};
pub use token::AgentToken;
