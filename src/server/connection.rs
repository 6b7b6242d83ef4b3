//! 单个入站 socket 的处理
//!
//! 服务器只监听一个端口，agent 隧道连接和公网访客连接混在一起。
//! 首段字节能解析为信封帧的是 agent，否则按访客处理。

use super::registry::{Assignment, Link, TunnelHandle};
use super::routes::RouteMatch;
use super::sniff::{bad_gateway_response, sniff, Sniffed};
use super::ServerState;
use crate::crypto;
use crate::error::{Result, TunnelError};
use crate::protocol::{Envelope, EnvelopeCodec, MessageKind, Protocol};
use crate::store::TunnelStatus;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const READ_BUF_SIZE: usize = 8 * 1024;

/// 连接分类结果
enum Classified {
    Agent(Envelope),
    Visitor,
}

/// 处理一个入站连接直到其关闭
pub(super) async fn handle_socket(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<ServerState>,
) -> Result<()> {
    let (mut reader, writer) = stream.into_split();
    let mut codec = EnvelopeCodec::new(state.options.max_frame_size);
    let mut buf = BytesMut::with_capacity(READ_BUF_SIZE);

    // 首帧（或访客请求头）必须在握手超时内到达
    let deadline = Instant::now() + state.options.handshake_timeout;

    let classified = loop {
        match codec.decode(&mut buf) {
            Ok(Some(msg)) => break Classified::Agent(msg),
            Ok(None) => {}
            Err(e) => {
                debug!("{} is not a tunnel frame ({}), treating as visitor", peer, e);
                break Classified::Visitor;
            }
        }

        let read = match timeout_at(deadline, reader.read_buf(&mut buf)).await {
            Ok(read) => read?,
            Err(_) => {
                debug!(
                    "{} sent no complete frame within {:?}, closing",
                    peer, state.options.handshake_timeout
                );
                return Ok(());
            }
        };
        if read == 0 {
            if buf.is_empty() {
                debug!("{} closed before sending any data", peer);
                return Ok(());
            }
            break Classified::Visitor;
        }
    };

    let cancel = CancellationToken::new();
    let link = Link::spawn(writer, state.options.channel_capacity, cancel.clone());

    match classified {
        Classified::Agent(first) => {
            let mut framed = FramedRead::new(reader, codec);
            framed.read_buffer_mut().extend_from_slice(&buf);
            TunnelConnection::new(state, link, peer)
                .run(first, framed, cancel)
                .await
        }
        Classified::Visitor => {
            run_visitor(state, link, peer, reader, buf, deadline, cancel).await
        }
    }
}

/// 已完成握手的隧道信息
struct Established {
    tunnel_id: String,
    conn_id: u64,
    token: String,
}

/// agent 隧道连接
struct TunnelConnection {
    state: Arc<ServerState>,
    link: Link,
    peer: SocketAddr,
    established: Option<Established>,
}

impl TunnelConnection {
    fn new(state: Arc<ServerState>, link: Link, peer: SocketAddr) -> Self {
        Self {
            state,
            link,
            peer,
            established: None,
        }
    }

    async fn run(
        mut self,
        first: Envelope,
        mut framed: FramedRead<OwnedReadHalf, EnvelopeCodec>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut next = Some(first);

        loop {
            let msg = match next.take() {
                Some(msg) => msg,
                None => tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Tunnel connection from {} cancelled", self.peer);
                        break;
                    }
                    frame = framed.next() => match frame {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => {
                            warn!("Tunnel connection from {} sent an invalid frame: {}", self.peer, e);
                            break;
                        }
                        None => {
                            info!("Tunnel connection from {} closed", self.peer);
                            break;
                        }
                    }
                },
            };

            match self.handle(msg).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    warn!("Tunnel connection from {} failed: {}", self.peer, e);
                    break;
                }
            }
        }

        self.cleanup().await;
        Ok(())
    }

    /// 返回 `false` 表示结束该连接
    async fn handle(&mut self, msg: Envelope) -> Result<bool> {
        match msg.kind {
            MessageKind::Connect => self.handle_connect(msg).await,
            MessageKind::Heartbeat => {
                debug!("Heartbeat from {}", self.peer);
                self.link.send_envelope(&Envelope::pong()).await?;
                Ok(true)
            }
            MessageKind::Data => {
                self.handle_data(msg).await?;
                Ok(true)
            }
            MessageKind::Disconnect if msg.is_exchange_close() => {
                self.finish_exchange(&msg.correlation_id);
                Ok(true)
            }
            MessageKind::Disconnect => {
                info!(
                    "Agent {} requested disconnect: {}",
                    self.peer,
                    msg.payload_text()
                );
                Ok(false)
            }
        }
    }

    async fn handle_connect(&mut self, msg: Envelope) -> Result<bool> {
        if let Some(established) = &self.established {
            warn!(
                "Duplicate handshake on tunnel '{}', ignoring",
                established.tunnel_id
            );
            return Ok(true);
        }

        let tunnel_id = msg.payload_text().trim().to_string();
        let tunnel = match self.state.tunnel_store.get_tunnel(&tunnel_id).await {
            Ok(Some(tunnel)) => tunnel,
            Ok(None) => {
                warn!("Rejecting unknown tunnel '{}' from {}", tunnel_id, self.peer);
                self.link
                    .send_envelope(&Envelope::disconnect("tunnel not found on server"))
                    .await?;
                return Ok(false);
            }
            Err(e) => {
                warn!("Tunnel lookup for '{}' failed: {}", tunnel_id, e);
                self.link
                    .send_envelope(&Envelope::disconnect("tunnel lookup failed"))
                    .await?;
                return Ok(false);
            }
        };

        if let Err(e) = crypto::validate_key(tunnel.token.as_bytes()) {
            warn!(
                "Tunnel '{}' has an unusable token ({}), rejecting",
                tunnel.id, e
            );
            self.link
                .send_envelope(&Envelope::disconnect("tunnel token is not a valid key"))
                .await?;
            return Ok(false);
        }

        let conn_id = self.state.registry.next_conn_id();
        self.state.registry.register_tunnel(
            &tunnel.id,
            conn_id,
            tunnel.token.clone(),
            self.link.clone(),
        );
        if let Err(e) = self
            .state
            .tunnel_store
            .update_status(&tunnel.id, TunnelStatus::Online)
            .await
        {
            warn!("Failed to mark tunnel '{}' online: {}", tunnel.id, e);
        }

        info!(
            "Tunnel '{}' ({}) connected from {} as connection #{}",
            tunnel.name, tunnel.id, self.peer, conn_id
        );

        self.established = Some(Established {
            tunnel_id: tunnel.id,
            conn_id,
            token: tunnel.token,
        });
        self.link
            .send_envelope(&Envelope::new(
                MessageKind::Connect,
                format!("tunnel '{}' connected", tunnel.name),
            ))
            .await?;
        Ok(true)
    }

    /// agent 返回的响应数据
    ///
    /// 只接受发给本连接所分发访客的数据。转发到访客不等待：
    /// 访客通道已满说明对端不再读取，此时结束该交换而不是阻塞整条隧道。
    async fn handle_data(&self, msg: Envelope) -> Result<()> {
        let Some(established) = &self.established else {
            warn!("Data before handshake from {}, dropping", self.peer);
            return Ok(());
        };

        let Some(visitor) = self.state.registry.dispatched_visitor(
            &msg.correlation_id,
            &established.tunnel_id,
            established.conn_id,
        ) else {
            debug!(
                "No visitor for correlation id '{}' on connection #{}, dropping response",
                msg.correlation_id, established.conn_id
            );
            return Ok(());
        };

        let plaintext = match crypto::decrypt(&msg.payload, established.token.as_bytes()) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!(
                    "Failed to decrypt response for '{}' on tunnel '{}': {}",
                    msg.correlation_id, established.tunnel_id, e
                );
                self.state.registry.abort_visitor(&msg.correlation_id);
                return self
                    .link
                    .send_envelope(&Envelope::close_exchange(msg.correlation_id))
                    .await;
            }
        };

        if let Err(e) = visitor.try_send(Bytes::from(plaintext)) {
            warn!(
                "Visitor '{}' on tunnel '{}' cannot take more data ({}), closing exchange",
                msg.correlation_id, established.tunnel_id, e
            );
            self.state.registry.abort_visitor(&msg.correlation_id);
            return self
                .link
                .send_envelope(&Envelope::close_exchange(msg.correlation_id))
                .await;
        }
        Ok(())
    }

    /// agent 结束了一次交换：写完已排队的响应后关闭访客
    fn finish_exchange(&self, correlation_id: &str) {
        let Some(established) = &self.established else {
            return;
        };
        let owned = self
            .state
            .registry
            .dispatched_visitor(correlation_id, &established.tunnel_id, established.conn_id)
            .is_some();
        if owned {
            debug!("Exchange '{}' finished by agent", correlation_id);
            self.state.registry.remove_visitor(correlation_id);
        }
    }

    async fn cleanup(&mut self) {
        // 未握手的连接直接丢弃链路，写任务会先发完拒绝原因
        let Some(established) = self.established.take() else {
            return;
        };

        // 先移除隧道：此后的分发无法再指派到本连接，随后清理已指派的访客
        let removed = self
            .state
            .registry
            .remove_tunnel(&established.tunnel_id, established.conn_id);

        let aborted = self
            .state
            .registry
            .abort_visitors_of(&established.tunnel_id, established.conn_id);
        if aborted > 0 {
            debug!(
                "Closed {} visitor(s) waiting on tunnel '{}'",
                aborted, established.tunnel_id
            );
        }

        if removed {
            if let Err(e) = self
                .state
                .tunnel_store
                .update_status(&established.tunnel_id, TunnelStatus::Offline)
                .await
            {
                warn!(
                    "Failed to mark tunnel '{}' offline: {}",
                    established.tunnel_id, e
                );
            }
            info!("Tunnel '{}' disconnected", established.tunnel_id);
        } else {
            debug!(
                "Connection #{} of tunnel '{}' was superseded",
                established.conn_id, established.tunnel_id
            );
        }
    }
}

/// 已分发的访客
struct Dispatched {
    route: RouteMatch,
    tunnel: TunnelHandle,
}

/// 公网访客连接
async fn run_visitor(
    state: Arc<ServerState>,
    link: Link,
    peer: SocketAddr,
    mut reader: OwnedReadHalf,
    mut buf: BytesMut,
    deadline: Instant,
    cancel: CancellationToken,
) -> Result<()> {
    let correlation_id = state.ids.new_id();
    state.registry.register_visitor(&correlation_id, link)?;

    // HTTP 请求需要完整的请求头才能取到 Host
    let mut sniffed = sniff(&buf);
    while sniffed.needs_more() && buf.len() < state.options.max_header_size {
        let n = tokio::select! {
            _ = cancel.cancelled() => {
                state.registry.remove_visitor(&correlation_id);
                return Ok(());
            }
            read = timeout_at(deadline, reader.read_buf(&mut buf)) => match read {
                Ok(read) => read,
                Err(_) => {
                    debug!("Visitor {} did not finish its request header in time", peer);
                    break;
                }
            },
        };
        match n {
            Ok(0) => break,
            Ok(_) => sniffed = sniff(&buf),
            Err(e) => {
                state.registry.abort_visitor(&correlation_id);
                return Err(e.into());
            }
        }
    }

    let first = buf.split().freeze();
    let dispatched = match dispatch(&state, &correlation_id, &sniffed, &first).await {
        Ok(dispatched) => dispatched,
        Err(e) => {
            warn!("Cannot dispatch visitor {}: {}", peer, e);
            reject_visitor(&state, &correlation_id, &sniffed, &e).await;
            return Ok(());
        }
    };

    info!(
        "Visitor {} dispatched to tunnel '{}' -> {} ({}, id {})",
        peer,
        dispatched.route.tunnel_id,
        dispatched.route.target,
        dispatched.route.protocol,
        correlation_id
    );

    if dispatched.route.protocol == Protocol::Ssh {
        // SSH 交互对延迟敏感
        if let Err(e) = reader.as_ref().set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }
    }

    // 后续数据继续转发到同一交换
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read_buf(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                debug!("Visitor {} finished sending", peer);
                let _ = dispatched
                    .tunnel
                    .link
                    .send_envelope(&Envelope::close_exchange(correlation_id.clone()))
                    .await;
                break;
            }
            Ok(_) => {
                let chunk = buf.split().freeze();
                if let Err(e) = forward(&dispatched.tunnel, &correlation_id, &chunk).await {
                    warn!("Failed to forward data from visitor {}: {}", peer, e);
                    state.registry.abort_visitor(&correlation_id);
                    break;
                }
            }
            Err(e) => {
                debug!("Visitor {} read error: {}", peer, e);
                state.registry.abort_visitor(&correlation_id);
                let _ = dispatched
                    .tunnel
                    .link
                    .send_envelope(&Envelope::close_exchange(correlation_id.clone()))
                    .await;
                break;
            }
        }
    }

    Ok(())
}

/// 查找路由和隧道，把首段数据加密后发给 agent
async fn dispatch(
    state: &ServerState,
    correlation_id: &str,
    sniffed: &Sniffed,
    first: &[u8],
) -> Result<Dispatched> {
    let route = match sniffed {
        Sniffed::Http {
            host: Some(host), ..
        } => state.routes.lookup(host)?,
        Sniffed::Http { host: None, .. } => {
            return Err(TunnelError::not_found("request has no Host header"))
        }
        Sniffed::Ssh => state.routes.lookup_protocol(Protocol::Ssh)?,
        Sniffed::Unknown => {
            return Err(TunnelError::not_found("unrecognized visitor protocol"))
        }
    };

    let tunnel = state.registry.tunnel(&route.tunnel_id).ok_or_else(|| {
        TunnelError::not_found(format!("tunnel '{}' is not connected", route.tunnel_id))
    })?;

    state.registry.assign_visitor(
        correlation_id,
        Assignment {
            tunnel_id: route.tunnel_id.clone(),
            conn_id: tunnel.conn_id,
        },
    )?;

    let sealed = crypto::encrypt(first, tunnel.token.as_bytes())?;

    let msg = Envelope::data(correlation_id, sealed).with_route(route.protocol, route.target.clone());
    tunnel.link.send_envelope(&msg).await?;

    Ok(Dispatched { route, tunnel })
}

async fn forward(tunnel: &TunnelHandle, correlation_id: &str, chunk: &[u8]) -> Result<()> {
    let sealed = crypto::encrypt(chunk, tunnel.token.as_bytes())?;
    tunnel
        .link
        .send_envelope(&Envelope::data(correlation_id, sealed))
        .await
}

/// 分发失败：HTTP 访客收到 502，其余直接关闭
async fn reject_visitor(state: &ServerState, correlation_id: &str, sniffed: &Sniffed, err: &TunnelError) {
    if let (Sniffed::Http { .. }, Some((link, _))) = (sniffed, state.registry.visitor(correlation_id)) {
        let _ = link
            .send(Bytes::from(bad_gateway_response(&err.to_string())))
            .await;
        state.registry.remove_visitor(correlation_id);
    } else {
        state.registry.abort_visitor(correlation_id);
    }
}
