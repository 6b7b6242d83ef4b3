mod connection;
mod registry;
mod routes;
mod sniff;

pub use registry::{Assignment, Link, Registry, TunnelHandle};
pub use routes::{RouteMatch, RouteTable};
pub use sniff::{bad_gateway_response, sniff, Sniffed};

use crate::config::{AppConfig, ServerFullConfig};
use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
use crate::store::{IdGenerator, MemoryStore, RouteStore, TunnelStore, UuidGenerator};
use anyhow::Context;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// 服务器运行参数
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// 单帧最大长度
    pub max_frame_size: usize,
    /// 每个连接写通道的容量
    pub channel_capacity: usize,
    /// 等待完整 HTTP 请求头的最大字节数
    pub max_header_size: usize,
    /// 新连接发出首帧或完整请求头的期限
    pub handshake_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            channel_capacity: 256,
            max_header_size: 16 * 1024,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// 服务器共享状态（所有连接任务共用）
pub struct ServerState {
    pub options: ServerOptions,
    pub registry: Registry,
    pub routes: RouteTable,
    pub tunnel_store: Arc<dyn TunnelStore>,
    pub route_store: Arc<dyn RouteStore>,
    pub ids: Arc<dyn IdGenerator>,
}

/// 隧道服务器
#[derive(Clone)]
pub struct Server {
    state: Arc<ServerState>,
}

impl Server {
    /// 创建服务器（路由表为空，需调用 `refresh_routes` 加载）
    pub fn new(
        options: ServerOptions,
        tunnel_store: Arc<dyn TunnelStore>,
        route_store: Arc<dyn RouteStore>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            state: Arc::new(ServerState {
                options,
                registry: Registry::new(),
                routes: RouteTable::default(),
                tunnel_store,
                route_store,
                ids,
            }),
        }
    }

    /// 使用内存存储和 UUID 生成器创建
    pub fn with_memory_store(options: ServerOptions, store: Arc<MemoryStore>) -> Self {
        Self::new(options, store.clone(), store, Arc::new(UuidGenerator))
    }

    /// 从路由存储重新加载路由表（整体替换）
    pub async fn refresh_routes(&self) -> crate::Result<usize> {
        let routes = self.state.route_store.routes().await?;
        let count = routes.len();
        self.state.routes.refresh(routes);
        info!("Route table refreshed: {} route(s)", count);
        Ok(count)
    }

    pub fn routes(&self) -> &RouteTable {
        &self.state.routes
    }

    pub fn registry(&self) -> &Registry {
        &self.state.registry
    }

    pub fn options(&self) -> &ServerOptions {
        &self.state.options
    }

    /// 接受连接直到 `shutdown` 完成，退出前关闭所有连接
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> crate::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = connection::handle_socket(stream, peer, state).await {
                                    warn!("Connection from {} ended with error: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("Received shutdown signal, stopping server...");
                    break;
                }
            }
        }

        self.state.registry.close_all();
        Ok(())
    }
}

/// 将配置中的种子数据写入内存存储
pub fn seed_store(store: &MemoryStore, config: &ServerFullConfig) {
    for tunnel in &config.tunnels {
        // 保留已有的在线状态
        if store.tunnel(&tunnel.id).is_none() {
            store.insert_tunnel(tunnel.clone().into());
        }
    }
    store.replace_routes(config.routes.clone());
}

/// 运行服务器（绑定端口、加载种子数据，Ctrl+C 停止）
pub async fn run_server(config: ServerFullConfig, config_path: Option<String>) -> anyhow::Result<()> {
    let listen_addr = config.server.listen_addr();
    info!("Starting tunnel relay server on {}", listen_addr);

    let store = Arc::new(MemoryStore::new());
    seed_store(&store, &config);
    info!(
        "Loaded {} tunnel(s) and {} route(s) from configuration",
        config.tunnels.len(),
        config.routes.len()
    );

    let server = Server::with_memory_store(config.server.options(), store.clone());
    server.refresh_routes().await?;

    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", listen_addr))?;
    info!("Server listening on {}", listen_addr);
    info!("Waiting for agents and visitors... (Press Ctrl+C to stop)");

    if let Some(path) = config_path {
        spawn_reload_on_hangup(server.clone(), store, path);
    }

    server
        .serve(listener, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("Server stopped gracefully");
    Ok(())
}

/// SIGHUP 时重新加载配置文件中的隧道和路由
#[cfg(unix)]
fn spawn_reload_on_hangup(server: Server, store: Arc<MemoryStore>, path: String) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(e) => {
                warn!("Failed to install SIGHUP handler: {}", e);
                return;
            }
        };

        while hangup.recv().await.is_some() {
            info!("Received SIGHUP, reloading routes from {}", path);
            match AppConfig::load_server_config(&path) {
                Ok(config) => {
                    seed_store(&store, &config);
                    if let Err(e) = server.refresh_routes().await {
                        error!("Failed to refresh routes: {}", e);
                    }
                }
                Err(e) => error!("Failed to reload configuration: {:#}", e),
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_on_hangup(_server: Server, _store: Arc<MemoryStore>, _path: String) {}
