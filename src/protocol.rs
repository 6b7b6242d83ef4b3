/// 隧道消息信封定义
///
/// 帧格式：长度前缀（4字节大端）+ JSON 消息体。
/// `data` 字段使用标准 base64 编码，加密时内容为 `nonce || ciphertext || tag`。
use crate::error::{Result, TunnelError};
use base64::Engine;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio_util::codec::{Decoder, Encoder};

/// 长度前缀大小
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// 默认最大帧长度（10MB）
pub const DEFAULT_MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// 心跳请求内容
pub const HEARTBEAT_PING: &[u8] = b"ping";

/// 心跳响应内容
pub const HEARTBEAT_PONG: &[u8] = b"pong";

/// 消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Data = 0,
    Connect = 1,
    Disconnect = 2,
    Heartbeat = 3,
}

impl TryFrom<u8> for MessageKind {
    type Error = TunnelError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageKind::Data),
            1 => Ok(MessageKind::Connect),
            2 => Ok(MessageKind::Disconnect),
            3 => Ok(MessageKind::Heartbeat),
            other => Err(TunnelError::decode(format!("unknown message type {}", other))),
        }
    }
}

impl Serialize for MessageKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for MessageKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = u8::deserialize(deserializer)?;
        MessageKind::try_from(value).map_err(serde::de::Error::custom)
    }
}

/// 转发协议（由服务端分发时填写）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Tcp,
    Udp,
    Ssh,
    Rdp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Ssh => "ssh",
            Protocol::Rdp => "rdp",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 线上传输的消息信封
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// 消息类型
    #[serde(rename = "type")]
    pub kind: MessageKind,

    /// 负载（加密时为密文）
    #[serde(rename = "data", with = "base64_bytes", default)]
    pub payload: Vec<u8>,

    /// 关联 ID（一次请求/响应交换内唯一）
    #[serde(rename = "id", default)]
    pub correlation_id: String,

    /// 转发协议
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,

    /// 目标地址
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target: String,
}

impl Envelope {
    /// 创建指定类型的消息
    pub fn new(kind: MessageKind, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            payload: payload.into(),
            correlation_id: String::new(),
            protocol: None,
            target: String::new(),
        }
    }

    /// 握手请求，负载为隧道 ID
    pub fn connect(tunnel_id: &str) -> Self {
        Self::new(MessageKind::Connect, tunnel_id.as_bytes())
    }

    /// 拒绝/断开，负载为原因
    pub fn disconnect(reason: &str) -> Self {
        Self::new(MessageKind::Disconnect, reason.as_bytes())
    }

    /// 结束某个交换
    pub fn close_exchange(correlation_id: impl Into<String>) -> Self {
        Self::new(MessageKind::Disconnect, Vec::new()).with_id(correlation_id)
    }

    pub fn ping() -> Self {
        Self::new(MessageKind::Heartbeat, HEARTBEAT_PING)
    }

    pub fn pong() -> Self {
        Self::new(MessageKind::Heartbeat, HEARTBEAT_PONG)
    }

    /// 数据消息
    pub fn data(correlation_id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(MessageKind::Data, payload).with_id(correlation_id)
    }

    pub fn with_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_route(mut self, protocol: Protocol, target: impl Into<String>) -> Self {
        self.protocol = Some(protocol);
        self.target = target.into();
        self
    }

    /// 负载按 UTF-8 解释（用于握手和断开原因）
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// 是否为结束某个交换的断开消息（而非断开整条隧道）
    pub fn is_exchange_close(&self) -> bool {
        self.kind == MessageKind::Disconnect && !self.correlation_id.is_empty()
    }
}

/// 编码为完整的一帧（长度前缀 + JSON）
pub fn encode(msg: &Envelope) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    EnvelopeCodec::default().encode(msg.clone(), &mut buf)?;
    Ok(buf.freeze())
}

/// 解码完整的一帧，截断或格式错误均返回 `Decode`
pub fn decode(frame: &[u8]) -> Result<Envelope> {
    let mut buf = BytesMut::from(frame);
    match EnvelopeCodec::default().decode(&mut buf)? {
        Some(msg) if buf.is_empty() => Ok(msg),
        Some(_) => Err(TunnelError::decode("trailing bytes after frame")),
        None => Err(TunnelError::decode("truncated frame")),
    }
}

/// 信封编解码器
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeCodec {
    max_frame_size: usize,
}

impl EnvelopeCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = TunnelError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
        len_buf.copy_from_slice(&src[..LENGTH_PREFIX_SIZE]);
        let msg_len = u32::from_be_bytes(len_buf) as usize;

        // 防止过大的消息；原始 HTTP/SSH 字节也会在这里被拒绝
        if msg_len == 0 || msg_len > self.max_frame_size {
            return Err(TunnelError::decode(format!(
                "invalid frame length: {} bytes",
                msg_len
            )));
        }

        if src.len() < LENGTH_PREFIX_SIZE + msg_len {
            src.reserve(LENGTH_PREFIX_SIZE + msg_len - src.len());
            return Ok(None);
        }

        let msg: Envelope = serde_json::from_slice(&src[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + msg_len])
            .map_err(|e| TunnelError::decode(e.to_string()))?;
        src.advance(LENGTH_PREFIX_SIZE + msg_len);
        Ok(Some(msg))
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = TunnelError;

    fn encode(&mut self, msg: Envelope, dst: &mut BytesMut) -> Result<()> {
        let body = serde_json::to_vec(&msg).map_err(|e| TunnelError::Other(e.into()))?;
        if body.len() > self.max_frame_size {
            return Err(TunnelError::write_failed(format!(
                "frame too large: {} bytes",
                body.len()
            )));
        }

        dst.reserve(LENGTH_PREFIX_SIZE + body.len());
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}
