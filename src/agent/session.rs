use super::relay::{RelayContext, RelayTable};
use crate::config::AgentConfig;
use crate::error::{Result, TunnelError};
use crate::protocol::{Envelope, EnvelopeCodec, MessageKind, HEARTBEAT_PING};
use futures::{SinkExt, StreamExt};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 会话时序参数
#[derive(Debug, Clone)]
pub struct SessionTiming {
    /// 心跳间隔
    pub heartbeat_interval: Duration,
    /// 心跳发出后等待服务器任意消息的时间
    pub heartbeat_timeout: Duration,
    /// 断线后的重连次数
    pub reconnect_attempts: u32,
    /// 每次重连前的等待时间
    pub reconnect_interval: Duration,
    /// 拨号和握手超时
    pub connect_timeout: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(10),
            reconnect_attempts: 3,
            reconnect_interval: Duration::from_secs(6),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// 已完成握手的隧道连接
pub struct Connection {
    reader: FramedRead<OwnedReadHalf, EnvelopeCodec>,
    writer: FramedWrite<OwnedWriteHalf, EnvelopeCodec>,
}

/// Agent 会话：维持到服务器的隧道连接，断线后有限次重连
pub struct AgentSession {
    config: AgentConfig,
    timing: SessionTiming,
    state_tx: watch::Sender<SessionState>,
    shutdown: CancellationToken,
}

impl AgentSession {
    pub fn new(config: AgentConfig) -> Self {
        let timing = config.timing();
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        Self {
            config,
            timing,
            state_tx,
            shutdown: CancellationToken::new(),
        }
    }

    /// 覆盖时序参数
    pub fn with_timing(mut self, timing: SessionTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// 订阅状态变化
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// 取消后 `run` 正常返回
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn set_state(&self, state: SessionState) {
        self.state_tx.send_replace(state);
    }

    /// 拨号并完成握手
    pub async fn connect(&self) -> Result<Connection> {
        let addr = self.config.server_addr.as_str();
        let connect_timeout = self.timing.connect_timeout;
        self.set_state(SessionState::Connecting);

        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TunnelError::timeout(connect_timeout))?
            .map_err(|e| TunnelError::connect_failed(addr, e))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }

        let (rd, wr) = stream.into_split();
        let mut reader = FramedRead::new(rd, EnvelopeCodec::default());
        let mut writer = FramedWrite::new(wr, EnvelopeCodec::default());

        writer.send(Envelope::connect(&self.config.tunnel_id)).await?;

        let reply = timeout(connect_timeout, reader.next())
            .await
            .map_err(|_| TunnelError::timeout(connect_timeout))?;

        match reply {
            Some(Ok(msg)) if msg.kind == MessageKind::Connect => {
                info!("Connected to {}: {}", addr, msg.payload_text());
                self.set_state(SessionState::Connected);
                Ok(Connection { reader, writer })
            }
            Some(Ok(msg)) if msg.kind == MessageKind::Disconnect => {
                Err(TunnelError::Rejected(msg.payload_text()))
            }
            Some(Ok(msg)) => Err(TunnelError::decode(format!(
                "unexpected handshake reply {:?}",
                msg.kind
            ))),
            Some(Err(e)) => Err(e),
            None => Err(TunnelError::connect_failed(
                addr,
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "server closed the connection during handshake",
                ),
            )),
        }
    }

    /// 运行会话直到关闭或重连次数耗尽
    ///
    /// 握手被拒绝时直接返回 `Rejected`，不会重试。
    pub async fn run(&self) -> Result<()> {
        let mut connection = match self.connect().await {
            Ok(connection) => Some(connection),
            Err(e @ TunnelError::Rejected(_)) => {
                error!("Server rejected the tunnel: {}", e);
                self.set_state(SessionState::Failed);
                return Err(e);
            }
            Err(e) => {
                warn!("Failed to connect: {}", e);
                None
            }
        };

        loop {
            if let Some(established) = connection.take() {
                match self.serve(established).await {
                    Ok(()) => {
                        self.set_state(SessionState::Disconnected);
                        return Ok(());
                    }
                    Err(e) => warn!("Tunnel connection lost: {}", e),
                }
            }

            connection = match self.reconnect().await {
                Ok(Some(established)) => Some(established),
                Ok(None) => {
                    self.set_state(SessionState::Disconnected);
                    return Ok(());
                }
                Err(e) => {
                    self.set_state(SessionState::Failed);
                    return Err(e);
                }
            };
        }
    }

    /// 按固定间隔重试，返回 `None` 表示期间收到关闭请求
    async fn reconnect(&self) -> Result<Option<Connection>> {
        let attempts = self.timing.reconnect_attempts;

        for attempt in 1..=attempts {
            self.set_state(SessionState::Reconnecting);
            info!(
                "Reconnecting in {:?} (attempt {}/{})",
                self.timing.reconnect_interval, attempt, attempts
            );

            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(None),
                _ = tokio::time::sleep(self.timing.reconnect_interval) => {}
            }

            match self.connect().await {
                Ok(connection) => return Ok(Some(connection)),
                Err(e @ TunnelError::Rejected(_)) => {
                    error!("Server rejected the tunnel: {}", e);
                    return Err(e);
                }
                Err(e) => warn!("Reconnect attempt {} failed: {}", attempt, e),
            }
        }

        error!("Giving up after {} reconnect attempts", attempts);
        Err(TunnelError::ReconnectExhausted { attempts })
    }

    /// 驱动一条已建立的连接，返回 `Ok` 表示主动关闭
    async fn serve(&self, connection: Connection) -> Result<()> {
        let Connection { mut reader, writer } = connection;

        let cancel = self.shutdown.child_token();
        let (out_tx, out_rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let alive = Arc::new(Notify::new());

        let send_task = tokio::spawn(send_loop(writer, out_rx, cancel.clone()));
        let heartbeat_task = tokio::spawn(heartbeat_loop(
            out_tx.clone(),
            alive.clone(),
            self.timing.clone(),
            cancel.clone(),
        ));

        let relays = RelayTable::new();
        let ctx = RelayContext {
            token: Arc::from(self.config.token.as_str()),
            outbound: out_tx.clone(),
            capacity: self.config.channel_capacity,
            connect_timeout: self.timing.connect_timeout,
            cancel: cancel.clone(),
        };

        let result = loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => {
                    if self.shutdown.is_cancelled() {
                        break Ok(());
                    }
                    break Err(TunnelError::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "heartbeat timed out or send failed",
                    )));
                }
                frame = reader.next() => frame,
            };

            let msg = match frame {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => break Err(e),
                None => {
                    break Err(TunnelError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "server closed the connection",
                    )))
                }
            };
            alive.notify_waiters();

            match msg.kind {
                MessageKind::Data => {
                    if let Err(e) = relays.deliver(msg, &ctx).await {
                        break Err(e);
                    }
                }
                MessageKind::Disconnect if msg.is_exchange_close() => {
                    if relays.finish(&msg.correlation_id) {
                        debug!("Visitor for '{}' finished sending", msg.correlation_id);
                    }
                }
                MessageKind::Disconnect => {
                    break Err(TunnelError::Io(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        format!("server closed the tunnel: {}", msg.payload_text()),
                    )));
                }
                MessageKind::Heartbeat => {
                    if msg.payload == HEARTBEAT_PING {
                        let _ = out_tx.send(Envelope::pong()).await;
                    } else {
                        debug!("Heartbeat acknowledged");
                    }
                }
                MessageKind::Connect => {
                    debug!("Ignoring unexpected connect message: {}", msg.payload_text());
                }
            }
        };

        cancel.cancel();
        let open = relays.len();
        if open > 0 {
            debug!("Dropping {} unfinished relay(s)", open);
        }
        relays.close_all();
        drop(ctx);
        drop(out_tx);
        let _ = heartbeat_task.await;
        let _ = send_task.await;

        result
    }
}

/// 单写者发送循环
async fn send_loop(
    mut writer: FramedWrite<OwnedWriteHalf, EnvelopeCodec>,
    mut rx: mpsc::Receiver<Envelope>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = writer.send(msg).await {
                        warn!("Failed to send to server: {}", e);
                        break;
                    }
                }
                None => break,
            }
        }
    }

    cancel.cancel();
    let _ = writer.close().await;
}

/// 心跳循环：发出心跳后在超时时间内必须收到服务器的任意消息
async fn heartbeat_loop(
    out: mpsc::Sender<Envelope>,
    alive: Arc<Notify>,
    timing: SessionTiming,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(timing.heartbeat_interval) => {}
        }

        // 先登记等待，避免回复早于等待而丢失
        let replied = alive.notified();
        if out.send(Envelope::ping()).await.is_err() {
            cancel.cancel();
            return;
        }
        debug!("Heartbeat sent");

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = replied => {}
            _ = tokio::time::sleep(timing.heartbeat_timeout) => {
                warn!("No reply from server within {:?}", timing.heartbeat_timeout);
                cancel.cancel();
                return;
            }
        }
    }
}
