use crate::config::RelayConfig;
use crate::counters::{OpenRequestGuard, SharedCounters};
use crate::error::RelayError;
use crate::http1::{self, BodyFraming, RequestHead};
use crate::legacy::UpstreamResponse;
use http::{Method, StatusCode, Version};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Chunks between two progress lines at debug level.
const PROGRESS_LOG_INTERVAL: u64 = 1000;

/// How a forward ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// Upstream reached EOF and everything was written to the client.
    Completed { bytes: u64 },
    /// The client went away mid-response.
    ClientDisconnected { bytes: u64 },
    /// The relay is shutting down.
    Cancelled { bytes: u64 },
}

/// Why a body copy stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CopyEnd {
    /// The framing says the body is over.
    Complete,
    Eof,
    Cancelled,
}

/// Read buffer and chunk count for one response body.
struct BodyPump {
    buf: Vec<u8>,
    chunks: u64,
}

impl BodyPump {
    fn new(buffer_size: usize) -> Self {
        Self {
            buf: vec![0u8; buffer_size.max(1)],
            chunks: 0,
        }
    }
}

/// Per-connection state. Owned by the task servicing the connection.
#[derive(Debug)]
pub struct RequestContext {
    pub id: u64,
    pub path: String,
    pub version: Version,
    pub bytes_forwarded: u64,
}

/// Forwards one inbound GET to the fixed upstream and streams the reply back.
pub struct RequestForwarder {
    config: Arc<RelayConfig>,
    counters: Arc<SharedCounters>,
    shutdown: CancellationToken,
    authority: String,
}

impl RequestForwarder {
    pub fn new(config: Arc<RelayConfig>, counters: Arc<SharedCounters>, shutdown: CancellationToken) -> Self {
        let authority = config.remote_authority();
        Self {
            config,
            counters,
            shutdown,
            authority,
        }
    }

    /// Services one accepted client connection: reads the request head,
    /// rejects anything but GET, and forwards the rest.
    pub async fn serve<C>(&self, client: C, peer: Option<SocketAddr>) -> Result<ForwardOutcome, RelayError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let (read_half, mut write_half) = tokio::io::split(client);
        let mut reader = BufReader::new(read_half);

        let request = match http1::read_request_head(&mut reader, self.config.max_header_size).await {
            Ok(request) => request,
            Err(e) => {
                let status = match &e {
                    RelayError::HeaderTooLarge(_) => Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE),
                    RelayError::MalformedRequest(_) => Some(StatusCode::BAD_REQUEST),
                    _ => None,
                };
                if let Some(status) = status {
                    let _ = http1::write_error_response(&mut write_half, Version::HTTP_10, status, &e.to_string()).await;
                }
                return Err(e);
            }
        };

        if request.method != Method::GET {
            let e = RelayError::UnsupportedMethod(request.method.to_string());
            warn!("Rejecting {} {} from {:?}", request.method, request.path, peer);
            let _ = http1::write_error_response(
                &mut write_half,
                request.version,
                StatusCode::NOT_IMPLEMENTED,
                &e.to_string(),
            )
            .await;
            return Err(e);
        }

        self.forward(request, &mut write_half, peer).await
    }

    /// Forwards a parsed GET request. The request stays counted as open for
    /// exactly the duration of this call, whatever the exit path.
    pub async fn forward<W>(
        &self,
        request: RequestHead,
        client: &mut W,
        peer: Option<SocketAddr>,
    ) -> Result<ForwardOutcome, RelayError>
    where
        W: AsyncWrite + Unpin,
    {
        let guard = OpenRequestGuard::new(self.counters.clone());
        let mut ctx = RequestContext {
            id: guard.id(),
            path: request.path.clone(),
            version: request.version,
            bytes_forwarded: 0,
        };

        match peer {
            Some(peer) => info!("[#{}] Received GET {} ({}) from {}", ctx.id, ctx.path, http1::version_str(ctx.version), peer),
            None => info!("[#{}] Received GET {} ({})", ctx.id, ctx.path, http1::version_str(ctx.version)),
        }

        match self.relay(&mut ctx, &request, client).await {
            Ok(outcome) => {
                match outcome {
                    ForwardOutcome::Completed { bytes } => {
                        info!("[#{}] Finished streaming {}, {} bytes relayed", ctx.id, ctx.path, bytes)
                    }
                    ForwardOutcome::Cancelled { bytes } => {
                        info!("[#{}] Stopped streaming {} on shutdown, {} bytes relayed", ctx.id, ctx.path, bytes)
                    }
                    ForwardOutcome::ClientDisconnected { .. } => {}
                }
                Ok(outcome)
            }
            Err(e) if e.is_client_disconnect() => {
                info!(
                    "[#{}] Finished streaming {}, client disconnected after {} bytes ({})",
                    ctx.id, ctx.path, ctx.bytes_forwarded, e
                );
                Ok(ForwardOutcome::ClientDisconnected { bytes: ctx.bytes_forwarded })
            }
            Err(e) => {
                error!("[#{}] Forwarding {} failed: {}", ctx.id, ctx.path, e);
                Err(e)
            }
        }
    }

    async fn relay<W>(&self, ctx: &mut RequestContext, request: &RequestHead, client: &mut W) -> Result<ForwardOutcome, RelayError>
    where
        W: AsyncWrite + Unpin,
    {
        let upstream = TcpStream::connect((self.config.remote_host(), self.config.port))
            .await
            .map_err(RelayError::Upstream)?;
        let mut upstream = BufReader::new(upstream);

        upstream
            .get_mut()
            .write_all(&request.encode_for_upstream(&self.authority))
            .await
            .map_err(RelayError::Upstream)?;

        let response = UpstreamResponse::read(&mut upstream, self.config.max_header_size).await?;
        if response.is_legacy() {
            info!("[#{}] Upstream sent no status line, relaying raw stream as 200", ctx.id);
        } else {
            info!("[#{}] Upstream responded {}", ctx.id, response.status());
        }

        let framing = response.body_framing()?;
        debug!("[#{}] Body framing: {:?}", ctx.id, framing);

        client
            .write_all(&response.client_head(ctx.version))
            .await
            .map_err(RelayError::Client)?;
        client.flush().await.map_err(RelayError::Client)?;

        let mut pump = BodyPump::new(self.config.buffer_size);
        let prelude = response.prelude();
        if !prelude.is_empty() {
            self.send(ctx, client, prelude, &mut pump.chunks).await?;
        }

        let end = match framing {
            BodyFraming::Length(len) => self.copy_body(ctx, &mut pump, &mut upstream, client, Some(len)).await?,
            BodyFraming::UntilClose => self.copy_body(ctx, &mut pump, &mut upstream, client, None).await?,
            BodyFraming::Chunked => self.copy_chunked(ctx, &mut pump, &mut upstream, client).await?,
        };

        match end {
            CopyEnd::Cancelled => return Ok(ForwardOutcome::Cancelled { bytes: ctx.bytes_forwarded }),
            CopyEnd::Eof if framing != BodyFraming::UntilClose => {
                warn!("[#{}] Upstream closed before the end of the body", ctx.id);
            }
            _ => {}
        }

        // One response per client connection.
        let _ = client.shutdown().await;
        Ok(ForwardOutcome::Completed { bytes: ctx.bytes_forwarded })
    }

    /// Copies body bytes until `limit` is used up, or until EOF without a limit.
    async fn copy_body<R, W>(
        &self,
        ctx: &mut RequestContext,
        pump: &mut BodyPump,
        upstream: &mut R,
        client: &mut W,
        limit: Option<u64>,
    ) -> Result<CopyEnd, RelayError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut remaining = limit;
        loop {
            if remaining == Some(0) {
                return Ok(CopyEnd::Complete);
            }
            if self.shutdown.is_cancelled() {
                return Ok(CopyEnd::Cancelled);
            }

            let want = match remaining {
                Some(r) => pump.buf.len().min(usize::try_from(r).unwrap_or(usize::MAX)),
                None => pump.buf.len(),
            };
            let n = upstream.read(&mut pump.buf[..want]).await.map_err(RelayError::Upstream)?;
            if n == 0 {
                return Ok(CopyEnd::Eof);
            }

            self.send(ctx, client, &pump.buf[..n], &mut pump.chunks).await?;
            if let Some(r) = remaining.as_mut() {
                *r -= n as u64;
            }
        }
    }

    /// Relays a chunked body verbatim, framing included, stopping after the
    /// zero-size chunk and its trailer section.
    async fn copy_chunked<R, W>(
        &self,
        ctx: &mut RequestContext,
        pump: &mut BodyPump,
        upstream: &mut R,
        client: &mut W,
    ) -> Result<CopyEnd, RelayError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let line_limit = self.config.max_header_size;
        let mut line = Vec::with_capacity(32);

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(CopyEnd::Cancelled);
            }

            line.clear();
            if http1::read_line_limited(upstream, &mut line, line_limit).await.map_err(RelayError::Upstream)? == 0 {
                return Ok(CopyEnd::Eof);
            }
            let size = http1::parse_chunk_size(&line)?;
            self.send(ctx, client, &line, &mut pump.chunks).await?;
            if size == 0 {
                break;
            }

            match self.copy_body(ctx, pump, upstream, client, Some(size)).await? {
                CopyEnd::Complete => {}
                end => return Ok(end),
            }

            line.clear();
            if http1::read_line_limited(upstream, &mut line, line_limit).await.map_err(RelayError::Upstream)? == 0 {
                return Ok(CopyEnd::Eof);
            }
            self.send(ctx, client, &line, &mut pump.chunks).await?;
        }

        loop {
            line.clear();
            if http1::read_line_limited(upstream, &mut line, line_limit).await.map_err(RelayError::Upstream)? == 0 {
                return Ok(CopyEnd::Eof);
            }
            self.send(ctx, client, &line, &mut pump.chunks).await?;
            if line == b"\r\n" || line == b"\n" {
                return Ok(CopyEnd::Complete);
            }
        }
    }

    /// Writes one chunk to the client and accounts for it.
    async fn send<W>(&self, ctx: &mut RequestContext, client: &mut W, bytes: &[u8], chunks: &mut u64) -> Result<(), RelayError>
    where
        W: AsyncWrite + Unpin,
    {
        client.write_all(bytes).await.map_err(RelayError::Client)?;
        client.flush().await.map_err(RelayError::Client)?;
        self.account(ctx, bytes.len());

        *chunks += 1;
        if *chunks == 1 || *chunks % PROGRESS_LOG_INTERVAL == 0 {
            debug!("[#{}] Chunk {}: {} bytes relayed so far", ctx.id, chunks, ctx.bytes_forwarded);
        }
        Ok(())
    }

    fn account(&self, ctx: &mut RequestContext, bytes: usize) {
        ctx.bytes_forwarded += bytes as u64;
        self.counters.record_bytes(bytes as u64);
    }
}
