//! 内网 agent
//!
//! 主动连接服务器并保持隧道，把服务器分发来的访客数据转发给内网目标。

mod relay;
mod session;

pub use relay::{normalize_target, RelayContext, RelayTable};
pub use session::{AgentSession, Connection, SessionState, SessionTiming};

use crate::config::AgentConfig;
use tracing::info;

/// 按配置运行 agent，Ctrl+C 停止；重连耗尽或被拒绝时返回错误
pub async fn run_agent(config: AgentConfig) -> anyhow::Result<()> {
    info!(
        "Starting agent for tunnel '{}' via {}",
        config.tunnel_id, config.server_addr
    );

    let session = AgentSession::new(config);
    let shutdown = session.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal, stopping agent...");
            shutdown.cancel();
        }
    });

    session.run().await?;
    info!("Agent stopped gracefully");
    Ok(())
}
