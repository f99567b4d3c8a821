//! Minimal HTTP/1.x head handling.
//!
//! Only the head of a message is parsed; bodies are relayed as opaque bytes.

use crate::error::RelayError;
use http::{Method, StatusCode, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_HEADERS: usize = 64;

pub type HeaderList = Vec<(String, Vec<u8>)>;

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub path: String,
    pub version: Version,
    pub headers: HeaderList,
}

/// How the end of a response body is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// Exactly this many bytes follow the head.
    Length(u64),
    /// `Transfer-Encoding: chunked`; the body ends after the zero-size chunk
    /// and its trailer section.
    Chunked,
    /// The body runs until the upstream closes the connection.
    UntilClose,
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: Version,
    pub status: StatusCode,
    pub reason: String,
    pub headers: HeaderList,
}

pub fn version_str(version: Version) -> &'static str {
    if version == Version::HTTP_10 { "HTTP/1.0" } else { "HTTP/1.1" }
}

fn version_from_minor(minor: Option<u8>) -> Version {
    match minor {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    }
}

/// Reads one line (terminator included) without consuming more than `limit` bytes.
pub async fn read_line_limited<R>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut limited = reader.take(limit as u64);
    limited.read_until(b'\n', buf).await
}

/// Reads header lines until the blank line that ends the head, appending
/// everything to `head`. `head` may already hold the start line.
pub async fn read_head_lines<R>(
    reader: &mut R,
    head: &mut Vec<u8>,
    max_header_size: usize,
) -> Result<(), RelayError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let remaining = max_header_size.saturating_sub(head.len());
        if remaining == 0 {
            return Err(RelayError::HeaderTooLarge(max_header_size));
        }

        let start = head.len();
        let n = read_line_limited(reader, head, remaining).await?;
        if n == 0 {
            return Err(RelayError::MalformedRequest("connection closed inside the header section".into()));
        }

        let line = &head[start..];
        if !line.ends_with(b"\n") {
            return Err(RelayError::HeaderTooLarge(max_header_size));
        }
        if line == b"\r\n" || line == b"\n" {
            return Ok(());
        }
    }
}

/// Reads and parses an inbound request head.
pub async fn read_request_head<R>(reader: &mut R, max_header_size: usize) -> Result<RequestHead, RelayError>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::with_capacity(512);
    read_head_lines(reader, &mut head, max_header_size).await?;
    parse_request_head(&head)
}

pub fn parse_request_head(bytes: &[u8]) -> Result<RequestHead, RelayError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(bytes) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(RelayError::MalformedRequest("incomplete request head".into()));
        }
        Err(e) => return Err(RelayError::MalformedRequest(e.to_string())),
    }

    let method = req.method.ok_or_else(|| RelayError::MalformedRequest("missing method".into()))?;
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|e| RelayError::MalformedRequest(e.to_string()))?;
    let path = req.path.ok_or_else(|| RelayError::MalformedRequest("missing path".into()))?;

    Ok(RequestHead {
        method,
        path: path.to_string(),
        version: version_from_minor(req.version),
        headers: collect_headers(req.headers),
    })
}

pub fn parse_response_head(bytes: &[u8]) -> Result<ResponseHead, RelayError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);

    match resp.parse(bytes) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(RelayError::MalformedResponse("incomplete response head".into()));
        }
        Err(e) => return Err(RelayError::MalformedResponse(e.to_string())),
    }

    let code = resp.code.ok_or_else(|| RelayError::MalformedResponse("missing status code".into()))?;
    let status = StatusCode::from_u16(code).map_err(|e| RelayError::MalformedResponse(e.to_string()))?;

    Ok(ResponseHead {
        version: version_from_minor(resp.version),
        status,
        reason: resp.reason.unwrap_or("").to_string(),
        headers: collect_headers(resp.headers),
    })
}

fn collect_headers(headers: &[httparse::Header<'_>]) -> HeaderList {
    headers
        .iter()
        .map(|h| (h.name.to_string(), h.value.to_vec()))
        .collect()
}

fn push_headers(out: &mut Vec<u8>, headers: &[(String, Vec<u8>)]) {
    for (name, value) in headers {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value);
        out.extend_from_slice(b"\r\n");
    }
}

impl RequestHead {
    /// Serializes the request for the upstream. `Host` is replaced with
    /// `authority`; every other header keeps its name, value and position.
    pub fn encode_for_upstream(&self, authority: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(self.method.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.path.as_bytes());
        out.push(b' ');
        out.extend_from_slice(version_str(self.version).as_bytes());
        out.extend_from_slice(b"\r\nHost: ");
        out.extend_from_slice(authority.as_bytes());
        out.extend_from_slice(b"\r\n");

        let forwarded: HeaderList = self
            .headers
            .iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case("host"))
            .cloned()
            .collect();
        push_headers(&mut out, &forwarded);
        out.extend_from_slice(b"\r\n");
        out
    }
}

impl ResponseHead {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(version_str(self.version).as_bytes());
        out.extend_from_slice(format!(" {} ", self.status.as_u16()).as_bytes());
        out.extend_from_slice(self.reason.as_bytes());
        out.extend_from_slice(b"\r\n");
        push_headers(&mut out, &self.headers);
        out.extend_from_slice(b"\r\n");
        out
    }
}

fn header_value<'a>(headers: &'a [(String, Vec<u8>)], name: &str) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_slice())
}

impl ResponseHead {
    /// Works out where the body ends. `Transfer-Encoding: chunked` wins over
    /// `Content-Length`; statuses that never carry a body get `Length(0)`.
    pub fn body_framing(&self) -> Result<BodyFraming, RelayError> {
        let status = self.status.as_u16();
        if self.status.is_informational() || status == 204 || status == 304 {
            return Ok(BodyFraming::Length(0));
        }

        if let Some(coding) = header_value(&self.headers, "transfer-encoding") {
            let last = coding.rsplit(|b| *b == b',').next().unwrap_or(coding);
            if last.trim_ascii().eq_ignore_ascii_case(b"chunked") {
                return Ok(BodyFraming::Chunked);
            }
            return Ok(BodyFraming::UntilClose);
        }

        match header_value(&self.headers, "content-length") {
            Some(value) => std::str::from_utf8(value.trim_ascii())
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(BodyFraming::Length)
                .ok_or_else(|| RelayError::MalformedResponse("invalid Content-Length".into())),
            None => Ok(BodyFraming::UntilClose),
        }
    }
}

/// Parses the size out of a chunk-size line (`1a;ext=x\r\n`).
pub fn parse_chunk_size(line: &[u8]) -> Result<u64, RelayError> {
    let size = line.split(|b| *b == b';').next().unwrap_or(line).trim_ascii();
    std::str::from_utf8(size)
        .ok()
        .filter(|s| !s.is_empty())
        .and_then(|s| u64::from_str_radix(s, 16).ok())
        .ok_or_else(|| RelayError::MalformedResponse(format!("invalid chunk size line {:?}", String::from_utf8_lossy(line))))
}

/// Writes a small plain-text error response for requests that never reach
/// the upstream.
pub async fn write_error_response<W>(writer: &mut W, version: Version, status: StatusCode, message: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let head = ResponseHead {
        version,
        status,
        reason: status.canonical_reason().unwrap_or("").to_string(),
        headers: vec![
            ("Content-Type".to_string(), b"text/plain; charset=utf-8".to_vec()),
            ("Content-Length".to_string(), message.len().to_string().into_bytes()),
            ("Connection".to_string(), b"close".to_vec()),
        ],
    };

    writer.write_all(&head.encode()).await?;
    writer.write_all(message.as_bytes()).await?;
    writer.flush().await
}
