use crate::error::{Result, TunnelError};
use crate::protocol::{encode, Envelope};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 单写者链路：socket 的写半部分只由一个专用任务持有
///
/// 所有发送方都把字节放入通道，由写任务按入队顺序写出，
/// 因此同一 socket 上不会出现交错写入。
#[derive(Clone, Debug)]
pub struct Link {
    tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

impl Link {
    /// 启动写任务
    ///
    /// 通道关闭时写任务先写完已排队的数据再关闭 socket；
    /// `close()` 则立即终止。写任务退出后会取消 `cancel`，
    /// 通知同一连接上的读任务一起退出。
    pub fn spawn<W>(writer: W, capacity: usize, cancel: CancellationToken) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(run_writer(writer, rx, cancel.clone()));
        Self { tx, cancel }
    }

    /// 入队待写字节
    pub async fn send(&self, bytes: Bytes) -> Result<()> {
        self.tx
            .send(bytes)
            .await
            .map_err(|_| TunnelError::write_failed("link closed"))
    }

    /// 不等待的入队；通道已满或已关闭时立即返回错误
    ///
    /// 隧道读循环用它向访客转发，单个不读数据的访客不会阻塞整条隧道。
    pub fn try_send(&self, bytes: Bytes) -> Result<()> {
        self.tx.try_send(bytes).map_err(|e| match e {
            TrySendError::Full(_) => TunnelError::write_failed("link full"),
            TrySendError::Closed(_) => TunnelError::write_failed("link closed"),
        })
    }

    /// 编码并入队一条信封
    pub async fn send_envelope(&self, msg: &Envelope) -> Result<()> {
        self.send(encode(msg)?).await
    }

    /// 立即关闭链路（丢弃未写出的数据）
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

async fn run_writer<W>(mut writer: W, mut rx: mpsc::Receiver<Bytes>, cancel: CancellationToken)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(bytes) => {
                    // 对端不读时写入会一直挂起，关闭请求必须能打断它
                    let written = tokio::select! {
                        _ = cancel.cancelled() => break,
                        written = writer.write_all(&bytes) => written,
                    };
                    if let Err(e) = written {
                        debug!("Link write error: {}", e);
                        break;
                    }
                }
                None => break,
            }
        }
    }

    if !cancel.is_cancelled() {
        let _ = writer.flush().await;
    }
    let _ = writer.shutdown().await;
    cancel.cancel();
}

/// 已建立的 agent 隧道连接
#[derive(Debug)]
pub struct ActiveTunnel {
    /// 连接序号，用于区分同一隧道 ID 的新旧连接
    pub conn_id: u64,
    /// 解密/加密使用的隧道密钥
    pub token: String,
    pub link: Link,
}

/// 访客被分发到的隧道连接
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub tunnel_id: String,
    pub conn_id: u64,
}

/// 隧道查找结果
#[derive(Debug, Clone)]
pub struct TunnelHandle {
    pub conn_id: u64,
    pub token: String,
    pub link: Link,
}

/// 等待响应的公网访客连接
#[derive(Debug)]
pub struct PendingVisitor {
    pub link: Link,
    /// 分发前为空
    pub assignment: Option<Assignment>,
}

#[derive(Default)]
struct RegistryInner {
    tunnels: HashMap<String, ActiveTunnel>,
    visitors: HashMap<String, PendingVisitor>,
}

/// 连接注册表
///
/// 隧道表和访客表共用一把互斥锁，锁只在操作 map 时持有，
/// 从不跨越网络 I/O。对外只暴露克隆出来的 `Link`。
#[derive(Default)]
pub struct Registry {
    inner: Mutex<RegistryInner>,
    next_conn_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 分配连接序号
    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// 注册隧道连接；已有同 ID 连接时关闭旧连接（后连接者胜出）
    pub fn register_tunnel(&self, tunnel_id: &str, conn_id: u64, token: String, link: Link) {
        let previous = self.inner.lock().tunnels.insert(
            tunnel_id.to_string(),
            ActiveTunnel {
                conn_id,
                token,
                link,
            },
        );

        if let Some(old) = previous {
            warn!(
                "Tunnel '{}' superseded by a newer connection, closing connection #{}",
                tunnel_id, old.conn_id
            );
            old.link.close();
        }
    }

    /// 移除隧道连接，只有序号匹配时才移除（避免误删新连接）
    pub fn remove_tunnel(&self, tunnel_id: &str, conn_id: u64) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            match inner.tunnels.get(tunnel_id) {
                Some(entry) if entry.conn_id == conn_id => inner.tunnels.remove(tunnel_id),
                _ => None,
            }
        };

        match removed {
            Some(entry) => {
                entry.link.close();
                true
            }
            None => false,
        }
    }

    /// 取得隧道的链路和密钥
    pub fn tunnel(&self, tunnel_id: &str) -> Option<TunnelHandle> {
        self.inner.lock().tunnels.get(tunnel_id).map(|entry| TunnelHandle {
            conn_id: entry.conn_id,
            token: entry.token.clone(),
            link: entry.link.clone(),
        })
    }

    pub fn tunnel_count(&self) -> usize {
        self.inner.lock().tunnels.len()
    }

    /// 注册访客连接，关联 ID 由调用方生成
    pub fn register_visitor(&self, correlation_id: &str, link: Link) -> Result<String> {
        let mut inner = self.inner.lock();
        if inner.visitors.contains_key(correlation_id) {
            return Err(TunnelError::Other(anyhow::anyhow!(
                "correlation id '{}' already in flight",
                correlation_id
            )));
        }
        inner.visitors.insert(
            correlation_id.to_string(),
            PendingVisitor {
                link,
                assignment: None,
            },
        );
        Ok(correlation_id.to_string())
    }

    /// 记录访客被分发到的隧道连接
    ///
    /// 与隧道表在同一把锁下检查：目标连接已被移除或替换时返回 `NotFound`，
    /// 因此分发成功的访客一定会被该连接的清理过程关闭。
    pub fn assign_visitor(&self, correlation_id: &str, assignment: Assignment) -> Result<()> {
        let mut inner = self.inner.lock();
        let live = inner
            .tunnels
            .get(&assignment.tunnel_id)
            .is_some_and(|entry| entry.conn_id == assignment.conn_id);
        if !live {
            return Err(TunnelError::not_found(format!(
                "tunnel '{}' connection #{} is gone",
                assignment.tunnel_id, assignment.conn_id
            )));
        }

        match inner.visitors.get_mut(correlation_id) {
            Some(entry) => {
                entry.assignment = Some(assignment);
                Ok(())
            }
            None => Err(TunnelError::not_found(format!(
                "visitor '{}'",
                correlation_id
            ))),
        }
    }

    /// 取得分发给指定隧道连接的访客链路，归属不符时返回 `None`
    pub fn dispatched_visitor(
        &self,
        correlation_id: &str,
        tunnel_id: &str,
        conn_id: u64,
    ) -> Option<Link> {
        let inner = self.inner.lock();
        let entry = inner.visitors.get(correlation_id)?;
        let owned = entry
            .assignment
            .as_ref()
            .is_some_and(|a| a.tunnel_id == tunnel_id && a.conn_id == conn_id);
        owned.then(|| entry.link.clone())
    }

    /// 取得访客的链路及其分发信息
    pub fn visitor(&self, correlation_id: &str) -> Option<(Link, Option<Assignment>)> {
        self.inner
            .lock()
            .visitors
            .get(correlation_id)
            .map(|entry| (entry.link.clone(), entry.assignment.clone()))
    }

    /// 移除访客；通道随之关闭，写任务写完已排队的数据后关闭 socket
    pub fn remove_visitor(&self, correlation_id: &str) -> bool {
        self.inner.lock().visitors.remove(correlation_id).is_some()
    }

    /// 移除访客并立即关闭 socket
    pub fn abort_visitor(&self, correlation_id: &str) -> bool {
        match self.inner.lock().visitors.remove(correlation_id) {
            Some(entry) => {
                entry.link.close();
                true
            }
            None => false,
        }
    }

    /// 关闭分发到某条隧道连接上的全部访客（该连接断开后响应不会再到达）
    pub fn abort_visitors_of(&self, tunnel_id: &str, conn_id: u64) -> usize {
        let orphaned: Vec<PendingVisitor> = {
            let mut inner = self.inner.lock();
            let ids: Vec<String> = inner
                .visitors
                .iter()
                .filter(|(_, v)| {
                    v.assignment
                        .as_ref()
                        .is_some_and(|a| a.tunnel_id == tunnel_id && a.conn_id == conn_id)
                })
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| inner.visitors.remove(id))
                .collect()
        };

        for visitor in &orphaned {
            visitor.link.close();
        }
        orphaned.len()
    }

    pub fn visitor_count(&self) -> usize {
        self.inner.lock().visitors.len()
    }

    /// 关闭全部连接（服务器停止时）
    pub fn close_all(&self) {
        let (tunnels, visitors) = {
            let mut inner = self.inner.lock();
            (
                std::mem::take(&mut inner.tunnels),
                std::mem::take(&mut inner.visitors),
            )
        };
        for entry in tunnels.into_values() {
            entry.link.close();
        }
        for entry in visitors.into_values() {
            entry.link.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    /// 建立一对已连接的 socket：(服务端, 对端)
    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (server.unwrap().0, client.unwrap())
    }

    async fn read_to_eof(stream: &mut TcpStream) -> Vec<u8> {
        let mut out = Vec::new();
        timeout(Duration::from_secs(5), stream.read_to_end(&mut out))
            .await
            .expect("peer should see EOF")
            .unwrap();
        out
    }

    #[tokio::test]
    async fn test_link_writes_in_order_then_closes() {
        let (server, mut peer) = socket_pair().await;
        let (_rd, wr) = server.into_split();
        let link = Link::spawn(wr, 4, CancellationToken::new());

        for chunk in ["one ", "two ", "three"] {
            link.send(Bytes::from(chunk)).await.unwrap();
        }
        drop(link);

        assert_eq!(read_to_eof(&mut peer).await, b"one two three");
    }

    #[tokio::test]
    async fn test_second_tunnel_registration_closes_first() {
        let registry = Registry::new();

        let (old_server, mut old_peer) = socket_pair().await;
        let (_old_rd, old_wr) = old_server.into_split();
        let old_link = Link::spawn(old_wr, 4, CancellationToken::new());
        let old_cancel = old_link.cancel_token();
        registry.register_tunnel("T1", 1, "k".repeat(16), old_link);

        let (new_server, _new_peer) = socket_pair().await;
        let (_new_rd, new_wr) = new_server.into_split();
        let new_link = Link::spawn(new_wr, 4, CancellationToken::new());
        registry.register_tunnel("T1", 2, "k".repeat(16), new_link);

        assert!(old_cancel.is_cancelled());
        assert!(read_to_eof(&mut old_peer).await.is_empty());
        assert_eq!(registry.tunnel_count(), 1);

        // 旧连接清理时不能删除新连接
        assert!(!registry.remove_tunnel("T1", 1));
        let handle = registry.tunnel("T1").unwrap();
        assert_eq!(handle.conn_id, 2);
        assert!(!handle.link.is_closed());
        assert!(registry.remove_tunnel("T1", 2));
        assert!(registry.tunnel("T1").is_none());
    }

    /// 创建一条对端被丢弃的链路
    async fn idle_link(capacity: usize) -> Link {
        let (server, _peer) = socket_pair().await;
        Link::spawn(server.into_split().1, capacity, CancellationToken::new())
    }

    fn assignment(tunnel_id: &str, conn_id: u64) -> Assignment {
        Assignment {
            tunnel_id: tunnel_id.to_string(),
            conn_id,
        }
    }

    #[tokio::test]
    async fn test_visitor_lifecycle() {
        let registry = Registry::new();
        registry.register_tunnel("T1", 7, "k".repeat(16), idle_link(4).await);

        let (server, mut peer) = socket_pair().await;
        let (_rd, wr) = server.into_split();
        let link = Link::spawn(wr, 4, CancellationToken::new());

        let id = registry.register_visitor("c1", link.clone()).unwrap();
        assert_eq!(id, "c1");
        assert!(registry.register_visitor("c1", link.clone()).is_err());
        drop(link);

        registry.assign_visitor("c1", assignment("T1", 7)).unwrap();
        assert!(registry.assign_visitor("c2", assignment("T1", 7)).unwrap_err().is_not_found());
        let (visitor_link, assigned) = registry.visitor("c1").unwrap();
        assert_eq!(assigned, Some(assignment("T1", 7)));

        visitor_link.send(Bytes::from_static(b"HTTP/1.1 200 OK\r\n\r\n")).await.unwrap();
        drop(visitor_link);
        assert!(registry.remove_visitor("c1"));
        assert!(!registry.remove_visitor("c1"));
        assert_eq!(registry.visitor_count(), 0);

        // 移除后先写完排队数据再关闭
        assert_eq!(read_to_eof(&mut peer).await, b"HTTP/1.1 200 OK\r\n\r\n");
    }

    #[tokio::test]
    async fn test_assign_to_gone_connection_fails() {
        let registry = Registry::new();
        registry.register_visitor("c1", idle_link(4).await).unwrap();

        // 隧道从未连接
        assert!(registry.assign_visitor("c1", assignment("T1", 1)).unwrap_err().is_not_found());

        // 已被新连接替换
        registry.register_tunnel("T1", 1, "k".repeat(16), idle_link(4).await);
        registry.register_tunnel("T1", 2, "k".repeat(16), idle_link(4).await);
        assert!(registry.assign_visitor("c1", assignment("T1", 1)).is_err());
        registry.assign_visitor("c1", assignment("T1", 2)).unwrap();

        // 已被移除
        assert!(registry.remove_tunnel("T1", 2));
        registry.register_visitor("c2", idle_link(4).await).unwrap();
        assert!(registry.assign_visitor("c2", assignment("T1", 2)).is_err());
        assert_eq!(registry.visitor("c2").unwrap().1, None);

        // 清理时关闭已分发的访客，未分发的访客不受影响
        assert_eq!(registry.abort_visitors_of("T1", 2), 1);
        assert!(registry.visitor("c1").is_none());
        assert!(registry.visitor("c2").is_some());
    }

    #[tokio::test]
    async fn test_dispatched_visitor_checks_owner() {
        let registry = Registry::new();
        registry.register_tunnel("T1", 3, "k".repeat(16), idle_link(4).await);
        registry.register_visitor("c1", idle_link(4).await).unwrap();
        registry.register_visitor("c2", idle_link(4).await).unwrap();
        registry.assign_visitor("c1", assignment("T1", 3)).unwrap();

        assert!(registry.dispatched_visitor("c1", "T1", 3).is_some());
        assert!(registry.dispatched_visitor("c1", "T1", 2).is_none());
        assert!(registry.dispatched_visitor("c1", "T2", 3).is_none());
        assert!(registry.dispatched_visitor("c2", "T1", 3).is_none());
        assert!(registry.dispatched_visitor("c3", "T1", 3).is_none());
    }

    #[tokio::test]
    async fn test_abort_visitors_of_connection() {
        let registry = Registry::new();
        registry.register_tunnel("T1", 1, "k".repeat(16), idle_link(4).await);
        let mut peers = Vec::new();
        for id in ["v1", "v2", "v3"] {
            let (server, peer) = socket_pair().await;
            peers.push(peer);
            let (_rd, wr) = server.into_split();
            let link = Link::spawn(wr, 4, CancellationToken::new());
            registry.register_visitor(id, link).unwrap();
        }
        registry.assign_visitor("v1", assignment("T1", 1)).unwrap();
        registry.assign_visitor("v2", assignment("T1", 1)).unwrap();

        // v3 分发给后来的连接
        registry.register_tunnel("T1", 2, "k".repeat(16), idle_link(4).await);
        registry.assign_visitor("v3", assignment("T1", 2)).unwrap();
        registry.register_visitor("v4", idle_link(4).await).unwrap();

        assert_eq!(registry.abort_visitors_of("T1", 1), 2);
        assert!(registry.visitor("v1").is_none());
        assert!(registry.visitor("v3").is_some());
        assert!(registry.visitor("v4").is_some());
        assert!(read_to_eof(&mut peers[0]).await.is_empty());
    }

    #[tokio::test]
    async fn test_try_send_does_not_wait_on_full_link() {
        let (server, _peer) = socket_pair().await;
        let (_rd, wr) = server.into_split();
        let link = Link::spawn(wr, 1, CancellationToken::new());

        // 对端不读，写任务最终阻塞在 socket 上，通道随之填满
        let chunk = Bytes::from(vec![0u8; 64 * 1024]);
        let filled = timeout(Duration::from_secs(5), async {
            loop {
                if link.try_send(chunk.clone()).is_err() {
                    return;
                }
                tokio::task::yield_now().await;
            }
        })
        .await;
        assert!(filled.is_ok());
        assert!(!link.is_closed());

        link.close();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(link.try_send(Bytes::from_static(b"x")).is_err());
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (server, _peer) = socket_pair().await;
        let (_rd, wr) = server.into_split();
        let link = Link::spawn(wr, 1, CancellationToken::new());
        link.close();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(link.is_closed());
        assert!(link.send(Bytes::from_static(b"x")).await.is_err());
    }
}
