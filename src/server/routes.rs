use crate::error::{Result, TunnelError};
use crate::protocol::Protocol;
use crate::store::Route;
use parking_lot::RwLock;
use std::sync::Arc;

/// 路由匹配结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub tunnel_id: String,
    pub protocol: Protocol,
    pub target: String,
}

impl From<&Route> for RouteMatch {
    fn from(route: &Route) -> Self {
        Self {
            tunnel_id: route.tunnel_id.clone(),
            protocol: route.protocol,
            target: route.target.clone(),
        }
    }
}

/// 路由表：不可变快照 + 整体替换
///
/// 锁只保护快照指针本身，查找时克隆 `Arc` 后即释放锁，
/// 刷新不会让并发查找看到半更新的表。
#[derive(Debug, Default)]
pub struct RouteTable {
    snapshot: RwLock<Arc<Vec<Route>>>,
}

impl RouteTable {
    pub fn new(routes: Vec<Route>) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(routes)),
        }
    }

    /// 当前快照
    pub fn snapshot(&self) -> Arc<Vec<Route>> {
        self.snapshot.read().clone()
    }

    /// 原子替换整张表
    pub fn refresh(&self, routes: Vec<Route>) {
        *self.snapshot.write() = Arc::new(routes);
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// 按主机名查找，按表顺序第一个匹配的规则生效
    pub fn lookup(&self, hostname: &str) -> Result<RouteMatch> {
        let routes = self.snapshot();
        routes
            .iter()
            .find(|route| hostname_matches(&route.hostname, hostname))
            .map(RouteMatch::from)
            .ok_or_else(|| TunnelError::not_found(format!("no route for host '{}'", hostname)))
    }

    /// 按协议查找（用于不携带主机名的协议，如 SSH）
    pub fn lookup_protocol(&self, protocol: Protocol) -> Result<RouteMatch> {
        let routes = self.snapshot();
        routes
            .iter()
            .find(|route| route.protocol == protocol)
            .map(RouteMatch::from)
            .ok_or_else(|| TunnelError::not_found(format!("no {} route", protocol)))
    }
}

/// 主机名比较（忽略大小写；规则未写端口时忽略请求中的端口）
fn hostname_matches(rule: &str, host: &str) -> bool {
    if rule.eq_ignore_ascii_case(host) {
        return true;
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            rule.eq_ignore_ascii_case(name)
        }
        _ => false,
    }
}
