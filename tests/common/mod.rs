//! Common utilities for integration tests
#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tunnel_relay::protocol::{Envelope, EnvelopeCodec, Protocol};
use tunnel_relay::server::{Server, ServerOptions};
use tunnel_relay::store::{MemoryStore, Route, Tunnel, TunnelStatus};

pub const TUNNEL_ID: &str = "T1";
pub const TOKEN: &str = "0123456789abcdef";
pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

pub fn http_route(id: &str, hostname: &str, target: &str) -> Route {
    Route {
        id: id.to_string(),
        tunnel_id: TUNNEL_ID.to_string(),
        hostname: hostname.to_string(),
        protocol: Protocol::Http,
        target: target.to_string(),
    }
}

/// 运行中的测试服务器，drop 时停止
pub struct TestServer {
    pub addr: SocketAddr,
    pub server: Server,
    pub store: Arc<MemoryStore>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl TestServer {
    /// 使用一个隧道（T1）和给定路由启动服务器
    pub async fn start(routes: Vec<Route>) -> Self {
        let store = Arc::new(MemoryStore::with_seed(
            vec![Tunnel::new(TUNNEL_ID, "home", TOKEN)],
            routes,
        ));
        Self::start_with_store(store).await
    }

    pub async fn start_with_store(store: Arc<MemoryStore>) -> Self {
        Self::start_with(ServerOptions::default(), store).await
    }

    /// 使用自定义选项启动，隧道和路由同 [`TestServer::start`]
    pub async fn start_with_options(options: ServerOptions, routes: Vec<Route>) -> Self {
        let store = Arc::new(MemoryStore::with_seed(
            vec![Tunnel::new(TUNNEL_ID, "home", TOKEN)],
            routes,
        ));
        Self::start_with(options, store).await
    }

    async fn start_with(options: ServerOptions, store: Arc<MemoryStore>) -> Self {
        let server = Server::with_memory_store(options, store.clone());
        server.refresh_routes().await.expect("Failed to load routes");

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind server");
        let addr = listener.local_addr().expect("Failed to get server addr");

        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn({
            let server = server.clone();
            async move {
                server
                    .serve(listener, async {
                        let _ = rx.await;
                    })
                    .await
                    .ok();
            }
        });

        Self {
            addr,
            server,
            store,
            shutdown: Some(tx),
            handle: Some(handle),
        }
    }

    /// 停止服务器并等待监听 socket 释放
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = timeout(IO_TIMEOUT, handle).await;
        }
    }

    pub fn status(&self, tunnel_id: &str) -> Option<TunnelStatus> {
        self.store.tunnel(tunnel_id).map(|t| t.status)
    }

    /// 轮询等待隧道状态变为期望值
    pub async fn wait_for_status(&self, tunnel_id: &str, status: TunnelStatus) -> bool {
        for _ in 0..50 {
            if self.status(tunnel_id) == Some(status) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    /// 轮询等待已注册的隧道数
    pub async fn wait_for_tunnels(&self, count: usize) -> bool {
        for _ in 0..50 {
            if self.server.registry().tunnel_count() == count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// 直接说线上协议的假 agent
pub struct FakeAgent {
    reader: FramedRead<OwnedReadHalf, EnvelopeCodec>,
    writer: FramedWrite<OwnedWriteHalf, EnvelopeCodec>,
}

impl FakeAgent {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr)
            .await
            .expect("Failed to connect fake agent");
        let (rd, wr) = stream.into_split();
        Self {
            reader: FramedRead::new(rd, EnvelopeCodec::default()),
            writer: FramedWrite::new(wr, EnvelopeCodec::default()),
        }
    }

    /// 连接并完成握手，返回服务器回复
    pub async fn handshake(addr: SocketAddr, tunnel_id: &str) -> (Self, Envelope) {
        let mut agent = Self::connect(addr).await;
        agent.send(Envelope::connect(tunnel_id)).await;
        let reply = agent.recv().await.expect("No handshake reply");
        (agent, reply)
    }

    pub async fn send(&mut self, msg: Envelope) {
        self.writer.send(msg).await.expect("Failed to send envelope");
    }

    /// 读取下一条消息，连接关闭时返回 `None`
    pub async fn recv(&mut self) -> Option<Envelope> {
        match timeout(IO_TIMEOUT, self.reader.next()).await {
            Ok(Some(Ok(msg))) => Some(msg),
            Ok(Some(Err(e))) => panic!("Invalid frame from server: {}", e),
            Ok(None) => None,
            Err(_) => panic!("Timeout waiting for envelope"),
        }
    }

    /// 在给定时间内没有收到任何消息
    pub async fn expect_silence(&mut self, wait: Duration) {
        if let Ok(frame) = timeout(wait, self.reader.next()).await {
            panic!("Unexpected frame: {:?}", frame);
        }
    }
}

/// 启动一个一次性 HTTP 目标：读完请求头后返回固定响应并关闭
pub async fn start_http_target(body: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind http target");
    let addr = listener.local_addr().expect("Failed to get target addr");

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    });

    addr
}

/// Create a simple echo server for testing
pub async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind echo server");
    let addr = listener.local_addr().expect("Failed to get echo addr");

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

/// 作为公网访客发送原始字节，读取直到服务器关闭连接
pub async fn visit(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr)
        .await
        .expect("Failed to connect visitor");
    stream
        .write_all(request)
        .await
        .expect("Failed to write request");

    read_until_closed(&mut stream).await
}

/// 读取直到对端关闭；被重置的连接返回已读到的部分
pub async fn read_until_closed(stream: &mut TcpStream) -> Vec<u8> {
    let mut response = Vec::new();
    let _ = timeout(IO_TIMEOUT, stream.read_to_end(&mut response))
        .await
        .expect("Timeout waiting for visitor response");
    response
}

pub fn http_get(host: &str) -> Vec<u8> {
    format!("GET / HTTP/1.1\r\nHost: {}\r\nUser-Agent: test\r\n\r\n", host).into_bytes()
}
