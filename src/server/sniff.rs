//! 访客流量的协议识别
//!
//! 访客连接发来的是原始字节，没有协议字段，只能按内容判断：
//! 以 HTTP 方法开头的视为 HTTP（再从 Host 头取主机名），以 `SSH-` 开头的视为 SSH。

const HTTP_METHODS: [&str; 7] = ["GET", "POST", "PUT", "DELETE", "OPTIONS", "HEAD", "PATCH"];

const MAX_HEADERS: usize = 64;

/// 识别结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sniffed {
    /// HTTP 请求，`host` 为空表示请求头尚不完整或缺少 Host
    Http { host: Option<String>, complete: bool },
    Ssh,
    Unknown,
}

impl Sniffed {
    /// HTTP 请求头是否还需要更多数据
    pub fn needs_more(&self) -> bool {
        matches!(self, Sniffed::Http { complete: false, .. })
    }
}

/// 识别首段字节
pub fn sniff(data: &[u8]) -> Sniffed {
    if data.starts_with(b"SSH-") {
        return Sniffed::Ssh;
    }
    if starts_with_http_method(data) {
        return sniff_http(data);
    }
    Sniffed::Unknown
}

fn starts_with_http_method(data: &[u8]) -> bool {
    HTTP_METHODS.iter().any(|method| {
        data.len() > method.len()
            && data[..method.len()].eq_ignore_ascii_case(method.as_bytes())
            && data[method.len()] == b' '
    })
}

fn sniff_http(data: &[u8]) -> Sniffed {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(data) {
        Ok(httparse::Status::Complete(_)) => Sniffed::Http {
            host: host_header(req.headers),
            complete: true,
        },
        Ok(httparse::Status::Partial) => Sniffed::Http {
            host: None,
            complete: false,
        },
        // 请求头不合法时不再等待，交给路由查找失败处理
        Err(_) => Sniffed::Http {
            host: None,
            complete: true,
        },
    }
}

fn host_header(headers: &[httparse::Header<'_>]) -> Option<String> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("host"))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// HTTP 访客分发失败时返回的响应
pub fn bad_gateway_response(reason: &str) -> Vec<u8> {
    let body = format!("502 Bad Gateway: {}\n", reason);
    format!(
        "HTTP/1.1 502 Bad Gateway\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
    .into_bytes()
}
