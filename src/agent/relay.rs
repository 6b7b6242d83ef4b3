//! 内网目标转发
//!
//! 服务器发来的每个关联 ID 对应一次交换：首个 `Data` 拨号到目标地址，
//! 之后同 ID 的数据写入同一连接；目标返回的数据逐块加密后以相同 ID 回传。

use crate::crypto;
use crate::error::{Result, TunnelError};
use crate::protocol::Envelope;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const RELAY_BUF_SIZE: usize = 16 * 1024;

/// 规范化目标地址：去掉 `http://`、`tcp://` 等前缀和路径部分
///
/// `http://` 目标未写端口时使用 80。
pub fn normalize_target(target: &str) -> String {
    let target = target.trim();
    let (scheme, rest) = match target.split_once("://") {
        Some((scheme, rest)) => (Some(scheme.to_ascii_lowercase()), rest),
        None => (None, target),
    };
    let authority = rest.split('/').next().unwrap_or(rest);

    let has_port = match authority.rsplit_once(':') {
        Some((_, port)) => !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    };

    match scheme.as_deref() {
        Some("http") if !has_port => format!("{}:80", authority),
        _ => authority.to_string(),
    }
}

/// 一条隧道连接上所有转发共用的上下文
#[derive(Clone)]
pub struct RelayContext {
    /// 隧道密钥
    pub token: Arc<str>,
    /// 会话发送通道
    pub outbound: mpsc::Sender<Envelope>,
    /// 每个转发输入通道的容量
    pub capacity: usize,
    /// 拨号超时
    pub connect_timeout: Duration,
    /// 隧道连接断开时取消
    pub cancel: CancellationToken,
}

/// 关联 ID -> 转发输入通道
/// 正在进行的转发
struct RelayEntry {
    input: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

#[derive(Clone, Default)]
pub struct RelayTable {
    inner: Arc<Mutex<HashMap<String, RelayEntry>>>,
}

impl RelayTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// 处理服务器发来的 `Data`
    pub async fn deliver(&self, msg: Envelope, ctx: &RelayContext) -> Result<()> {
        let correlation_id = msg.correlation_id;

        let plaintext = match crypto::decrypt(&msg.payload, ctx.token.as_bytes()) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!("Failed to decrypt data for '{}': {}", correlation_id, e);
                self.abort(&correlation_id);
                return ctx
                    .outbound
                    .send(Envelope::close_exchange(correlation_id))
                    .await
                    .map_err(|_| TunnelError::write_failed("session closed"));
            }
        };

        let existing = self
            .inner
            .lock()
            .get(&correlation_id)
            .map(|entry| entry.input.clone());
        if let Some(input) = existing {
            // 不等待：目标不再读取时结束该交换，不阻塞会话读循环
            return match input.try_send(Bytes::from(plaintext)) {
                Ok(()) => Ok(()),
                Err(TrySendError::Closed(_)) => {
                    debug!("Relay '{}' already finished, dropping data", correlation_id);
                    Ok(())
                }
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "Target of relay '{}' is not keeping up, closing exchange",
                        correlation_id
                    );
                    self.abort(&correlation_id);
                    ctx.outbound
                        .send(Envelope::close_exchange(correlation_id))
                        .await
                        .map_err(|_| TunnelError::write_failed("session closed"))
                }
            };
        }

        if msg.target.is_empty() {
            warn!("Data for unknown exchange '{}' without target, dropping", correlation_id);
            return ctx
                .outbound
                .send(Envelope::close_exchange(correlation_id))
                .await
                .map_err(|_| TunnelError::write_failed("session closed"));
        }

        let (input, rx) = mpsc::channel(ctx.capacity.max(1));
        // 新通道一定有空位
        let _ = input.try_send(Bytes::from(plaintext));
        let cancel = ctx.cancel.child_token();
        self.inner.lock().insert(
            correlation_id.clone(),
            RelayEntry {
                input,
                cancel: cancel.clone(),
            },
        );

        let protocol = msg.protocol.map(|p| p.as_str()).unwrap_or("tcp");
        debug!(
            "Opening relay '{}' to {} ({})",
            correlation_id, msg.target, protocol
        );
        tokio::spawn(run_relay(
            correlation_id,
            normalize_target(&msg.target),
            rx,
            ctx.clone(),
            cancel,
            self.clone(),
        ));
        Ok(())
    }

    /// 结束一次交换的上行：丢弃输入通道，目标连接随之半关闭
    pub fn finish(&self, correlation_id: &str) -> bool {
        self.inner.lock().remove(correlation_id).is_some()
    }

    /// 立即终止一次转发，目标连接直接关闭
    pub fn abort(&self, correlation_id: &str) -> bool {
        match self.inner.lock().remove(correlation_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// 丢弃全部输入通道（隧道连接断开时）
    pub fn close_all(&self) {
        self.inner.lock().clear();
    }
}

/// 拨号失败：通知服务器结束交换（已被终止的交换由终止方通知）
async fn close_failed(
    correlation_id: &str,
    ctx: &RelayContext,
    cancel: &CancellationToken,
    table: &RelayTable,
) {
    table.finish(correlation_id);
    if !cancel.is_cancelled() {
        let _ = ctx
            .outbound
            .send(Envelope::close_exchange(correlation_id))
            .await;
    }
}

async fn run_relay(
    correlation_id: String,
    target: String,
    mut input: mpsc::Receiver<Bytes>,
    ctx: RelayContext,
    cancel: CancellationToken,
    table: RelayTable,
) {
    let stream = match tokio::time::timeout(ctx.connect_timeout, TcpStream::connect(&target)).await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!("Relay '{}' failed to connect to {}: {}", correlation_id, target, e);
            close_failed(&correlation_id, &ctx, &cancel, &table).await;
            return;
        }
        Err(_) => {
            warn!(
                "Relay '{}' timed out connecting to {} after {:?}",
                correlation_id, target, ctx.connect_timeout
            );
            close_failed(&correlation_id, &ctx, &cancel, &table).await;
            return;
        }
    };

    let _ = stream.set_nodelay(true);
    let (mut target_rd, mut target_wr) = stream.into_split();

    // 上行：服务器转来的访客数据写入目标，通道关闭后半关闭目标连接
    let uplink_id = correlation_id.clone();
    let uplink = tokio::spawn(async move {
        while let Some(chunk) = input.recv().await {
            if let Err(e) = target_wr.write_all(&chunk).await {
                debug!("Relay '{}' write to target failed: {}", uplink_id, e);
                return;
            }
        }
        let _ = target_wr.shutdown().await;
    });

    // 下行：目标返回的数据逐块加密回传
    let mut buf = vec![0u8; RELAY_BUF_SIZE];
    let mut total = 0usize;
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = target_rd.read(&mut buf) => read,
        };

        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("Relay '{}' read from target failed: {}", correlation_id, e);
                break;
            }
        };

        let sealed = match crypto::encrypt(&buf[..n], ctx.token.as_bytes()) {
            Ok(sealed) => sealed,
            Err(e) => {
                warn!("Relay '{}' failed to encrypt response: {}", correlation_id, e);
                break;
            }
        };
        if ctx
            .outbound
            .send(Envelope::data(correlation_id.clone(), sealed))
            .await
            .is_err()
        {
            break;
        }
        total += n;
    }

    table.finish(&correlation_id);
    uplink.abort();

    if !cancel.is_cancelled() {
        let _ = ctx
            .outbound
            .send(Envelope::close_exchange(correlation_id.clone()))
            .await;
    }
    info!(
        "Relay '{}' to {} finished ({} bytes returned)",
        correlation_id, target, total
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageKind, Protocol};
    use tokio::net::TcpListener;

    const KEY: &str = "0123456789abcdef";

    #[test]
    fn test_normalize_target() {
        assert_eq!(normalize_target("127.0.0.1:8080"), "127.0.0.1:8080");
        assert_eq!(normalize_target("http://127.0.0.1:8080"), "127.0.0.1:8080");
        assert_eq!(normalize_target("http://localhost:3000/api/v1"), "localhost:3000");
        assert_eq!(normalize_target("http://intranet.local"), "intranet.local:80");
        assert_eq!(normalize_target("tcp://10.0.0.5:22"), "10.0.0.5:22");
        assert_eq!(normalize_target(" [::1]:22 "), "[::1]:22");
    }

    fn context(outbound: mpsc::Sender<Envelope>) -> RelayContext {
        RelayContext {
            token: Arc::from(KEY),
            outbound,
            capacity: 8,
            connect_timeout: Duration::from_secs(2),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_relay_streams_response_then_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 5];
            socket.read_exact(&mut request).await.unwrap();
            assert_eq!(&request, b"hello");
            socket.write_all(b"world").await.unwrap();
        });

        let (tx, mut rx) = mpsc::channel(8);
        let ctx = context(tx);
        let table = RelayTable::new();
        let sealed = crypto::encrypt(b"hello", KEY.as_bytes()).unwrap();
        let msg = Envelope::data("c1", sealed).with_route(Protocol::Tcp, addr.to_string());
        table.deliver(msg, &ctx).await.unwrap();

        let mut response = Vec::new();
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(msg.correlation_id, "c1");
            if msg.kind == MessageKind::Disconnect {
                break;
            }
            response.extend(crypto::decrypt(&msg.payload, KEY.as_bytes()).unwrap());
        }
        assert_eq!(response, b"world");
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_target_closes_exchange() {
        // 绑定后立即释放，得到一个无人监听的端口
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let (tx, mut rx) = mpsc::channel(8);
        let ctx = context(tx);
        let table = RelayTable::new();
        let sealed = crypto::encrypt(b"GET / HTTP/1.1\r\n\r\n", KEY.as_bytes()).unwrap();
        let msg = Envelope::data("c2", sealed).with_route(Protocol::Http, addr.to_string());
        table.deliver(msg, &ctx).await.unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(reply.is_exchange_close());
        assert_eq!(reply.correlation_id, "c2");
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_tampered_data_is_rejected() {
        let (tx, mut rx) = mpsc::channel(8);
        let ctx = context(tx);
        let table = RelayTable::new();

        let mut sealed = crypto::encrypt(b"hello", KEY.as_bytes()).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        let msg = Envelope::data("c3", sealed).with_route(Protocol::Tcp, "127.0.0.1:9");
        table.deliver(msg, &ctx).await.unwrap();

        let reply = rx.recv().await.unwrap();
        assert!(reply.is_exchange_close());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_stalled_target_does_not_block_delivery() {
        // 目标接受连接但从不读取
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let (tx, mut rx) = mpsc::channel(8);
        let mut ctx = context(tx);
        ctx.capacity = 2;
        let table = RelayTable::new();

        let sealed = crypto::encrypt(&vec![0u8; 64 * 1024], KEY.as_bytes()).unwrap();
        let first = Envelope::data("c4", sealed.clone()).with_route(Protocol::Tcp, addr.to_string());
        table.deliver(first, &ctx).await.unwrap();

        for _ in 0..400 {
            if table.is_empty() {
                break;
            }
            tokio::time::timeout(
                Duration::from_secs(1),
                table.deliver(Envelope::data("c4", sealed.clone()), &ctx),
            )
            .await
            .expect("delivery must not wait on a stalled target")
            .unwrap();
        }
        assert!(table.is_empty());

        let reply = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(reply.is_exchange_close());
        assert_eq!(reply.correlation_id, "c4");

        // 终止后不会再发出第二个结束消息
        assert!(tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .is_err());
        ctx.cancel.cancel();
    }
}
