//! Upstream response sniffing with a fallback for status-line-free replies.
//!
//! Some casters answer with a bare body (HTTP/0.9 style) or with a private
//! first line such as `ICY 200 OK`. Anything that does not start with
//! `HTTP/` is relayed as a `200` whose body is the complete upstream byte
//! stream, the sniffed bytes included.

use crate::error::RelayError;
use crate::http1::{self, BodyFraming, ResponseHead};
use http::{StatusCode, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

const STATUS_LINE_PREFIX: &[u8] = b"HTTP/";

#[derive(Debug, Clone)]
pub enum UpstreamResponse {
    /// Conformant status line and header block.
    Standard(ResponseHead),
    /// No status line. `prelude` holds the bytes consumed while sniffing,
    /// which belong to the body.
    LegacyRaw { prelude: Vec<u8> },
}

impl UpstreamResponse {
    /// Reads the response head from `reader`, choosing the parsing strategy
    /// from the first bytes. Body bytes beyond the head remain in `reader`.
    ///
    /// The choice is made as soon as the bytes seen stop matching `HTTP/`, so
    /// a raw stream is handed over without waiting for a full line.
    pub async fn read<R>(reader: &mut R, max_header_size: usize) -> Result<Self, RelayError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut head = Vec::with_capacity(512);
        while head.len() < STATUS_LINE_PREFIX.len() {
            let available = reader.fill_buf().await.map_err(RelayError::Upstream)?;
            if available.is_empty() {
                if head.is_empty() {
                    return Err(RelayError::UpstreamClosed);
                }
                return Ok(UpstreamResponse::LegacyRaw { prelude: head });
            }

            let take = available.len().min(STATUS_LINE_PREFIX.len() - head.len());
            head.extend_from_slice(&available[..take]);
            reader.consume(take);

            if !STATUS_LINE_PREFIX.starts_with(&head) {
                return Ok(UpstreamResponse::LegacyRaw { prelude: head });
            }
        }

        http1::read_head_lines(reader, &mut head, max_header_size)
            .await
            .map_err(|e| match e {
                RelayError::Io(e) => RelayError::Upstream(e),
                RelayError::MalformedRequest(msg) => RelayError::MalformedResponse(msg),
                other => other,
            })?;

        Ok(UpstreamResponse::Standard(http1::parse_response_head(&head)?))
    }

    /// Legacy replies have no framing and always run until close.
    pub fn body_framing(&self) -> Result<BodyFraming, RelayError> {
        match self {
            UpstreamResponse::Standard(head) => head.body_framing(),
            UpstreamResponse::LegacyRaw { .. } => Ok(BodyFraming::UntilClose),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            UpstreamResponse::Standard(head) => head.status,
            UpstreamResponse::LegacyRaw { .. } => StatusCode::OK,
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, UpstreamResponse::LegacyRaw { .. })
    }

    /// Response head for the client. Legacy replies get a synthesized
    /// `200 OK` in the client's protocol version and no headers at all.
    pub fn client_head(&self, client_version: Version) -> Vec<u8> {
        match self {
            UpstreamResponse::Standard(head) => head.encode(),
            UpstreamResponse::LegacyRaw { .. } => ResponseHead {
                version: client_version,
                status: StatusCode::OK,
                reason: "OK".to_string(),
                headers: Vec::new(),
            }
            .encode(),
        }
    }

    /// Body bytes already pulled off the upstream socket.
    pub fn prelude(&self) -> &[u8] {
        match self {
            UpstreamResponse::Standard(_) => &[],
            UpstreamResponse::LegacyRaw { prelude } => prelude,
        }
    }
}
