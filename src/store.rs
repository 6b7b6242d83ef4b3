/// 隧道与路由存储接口
///
/// 核心只通过这里的 trait 访问持久化数据；`MemoryStore` 是内置实现，
/// 服务器从配置文件的种子数据加载，测试也直接使用它。
use crate::error::Result;
use crate::protocol::Protocol;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::SystemTime;

/// 隧道在线状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    #[default]
    Offline,
    Online,
}

/// 隧道记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tunnel {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub status: TunnelStatus,
    /// 共享密钥，同时作为该隧道流量的加密密钥
    pub token: String,
    /// 最近一次状态变化的时间（Unix 秒）
    #[serde(default)]
    pub last_seen: Option<u64>,
}

impl Tunnel {
    pub fn new(id: impl Into<String>, name: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: TunnelStatus::Offline,
            token: token.into(),
            last_seen: None,
        }
    }
}

/// 路由规则：公网主机名 -> 隧道 + 内网目标
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    pub tunnel_id: String,
    pub hostname: String,
    pub protocol: Protocol,
    /// agent 内网可达的目标地址
    pub target: String,
}

#[async_trait]
pub trait TunnelStore: Send + Sync {
    async fn get_tunnel(&self, id: &str) -> Result<Option<Tunnel>>;

    /// 更新在线状态，同时刷新 `last_seen`
    async fn update_status(&self, id: &str, status: TunnelStatus) -> Result<()>;
}

#[async_trait]
pub trait RouteStore: Send + Sync {
    /// 当前全部路由（按插入顺序）
    async fn routes(&self) -> Result<Vec<Route>>;
}

/// 关联 ID 生成器
pub trait IdGenerator: Send + Sync {
    fn new_id(&self) -> String;
}

/// 基于 UUID v4 的 ID 生成器
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn new_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// 内存存储
#[derive(Debug, Default)]
pub struct MemoryStore {
    tunnels: RwLock<HashMap<String, Tunnel>>,
    routes: RwLock<Vec<Route>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 使用种子数据创建
    pub fn with_seed(tunnels: Vec<Tunnel>, routes: Vec<Route>) -> Self {
        let store = Self::new();
        for tunnel in tunnels {
            store.insert_tunnel(tunnel);
        }
        store.replace_routes(routes);
        store
    }

    pub fn insert_tunnel(&self, tunnel: Tunnel) {
        self.tunnels.write().insert(tunnel.id.clone(), tunnel);
    }

    /// 同步读取（测试和状态展示用）
    pub fn tunnel(&self, id: &str) -> Option<Tunnel> {
        self.tunnels.read().get(id).cloned()
    }

    /// 整体替换路由
    pub fn replace_routes(&self, routes: Vec<Route>) {
        *self.routes.write() = routes;
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[async_trait]
impl TunnelStore for MemoryStore {
    async fn get_tunnel(&self, id: &str) -> Result<Option<Tunnel>> {
        Ok(self.tunnel(id))
    }

    async fn update_status(&self, id: &str, status: TunnelStatus) -> Result<()> {
        if let Some(tunnel) = self.tunnels.write().get_mut(id) {
            tunnel.status = status;
            tunnel.last_seen = Some(unix_now());
        }
        Ok(())
    }
}

#[async_trait]
impl RouteStore for MemoryStore {
    async fn routes(&self) -> Result<Vec<Route>> {
        Ok(self.routes.read().clone())
    }
}
