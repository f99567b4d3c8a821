//! End-to-end tests driving the relay over real sockets.

use http_relay::config::RelayConfig;
use http_relay::counters::SharedCounters;
use http_relay::forwarder::{ForwardOutcome, RequestForwarder};
use http_relay::http1::parse_request_head;
use http_relay::{Relay, RelayError};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

/// Reads a request head off `stream`, returning it as text.
async fn read_head(stream: &mut BufReader<TcpStream>) -> String {
    let mut head = String::new();
    loop {
        let mut line = String::new();
        if stream.read_line(&mut line).await.unwrap() == 0 {
            break;
        }
        head.push_str(&line);
        if line == "\r\n" {
            break;
        }
    }
    head
}

/// Upstream that answers every request with `respond(head)` and then closes.
/// Received request heads are sent on the returned channel.
async fn spawn_upstream<F>(respond: F) -> (SocketAddr, mpsc::UnboundedReceiver<String>)
where
    F: Fn(&str) -> (Duration, Vec<u8>) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    let respond = Arc::new(respond);

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            let tx = tx.clone();
            let respond = respond.clone();
            tokio::spawn(async move {
                let mut stream = BufReader::new(stream);
                let head = read_head(&mut stream).await;
                let (delay, body) = respond(&head);
                let _ = tx.send(head);
                sleep(delay).await;
                let _ = stream.get_mut().write_all(&body).await;
                let _ = stream.get_mut().shutdown().await;
            });
        }
    });

    (addr, rx)
}

/// Upstream that answers with `reply` and then keeps the connection open
/// until the relay hangs up, as an HTTP/1.1 server would.
async fn spawn_keepalive_upstream(reply: Vec<u8>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let reply = Arc::new(reply);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let reply = reply.clone();
            tokio::spawn(async move {
                let mut stream = BufReader::new(stream);
                read_head(&mut stream).await;
                let _ = stream.get_mut().write_all(&reply).await;
                let mut rest = Vec::new();
                let _ = stream.read_to_end(&mut rest).await;
            });
        }
    });

    addr
}

async fn fetch_within(relay: SocketAddr, request: &str) -> Vec<u8> {
    timeout(Duration::from_secs(3), fetch(relay, request))
        .await
        .expect("relay kept the client connection open after the body")
}

fn relay_config(upstream: SocketAddr, num_threads: usize, buffer_size: usize) -> RelayConfig {
    let mut config = RelayConfig::new(upstream.ip().to_string(), upstream.port());
    config.local_addr = "127.0.0.1".to_string();
    config.local_port = Some(0);
    config.num_threads = num_threads;
    config.buffer_size = buffer_size;
    config
}

async fn start_relay(config: RelayConfig) -> (SocketAddr, Arc<SharedCounters>, CancellationToken) {
    let relay = Relay::bind(config).await.unwrap();
    let addr = relay.local_addr();
    let counters = relay.counters();
    let (shutdown, _handle) = relay.spawn();
    (addr, counters, shutdown)
}

async fn fetch(relay: SocketAddr, request: &str) -> Vec<u8> {
    let mut stream = TcpStream::connect(relay).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    response
}

async fn wait_for_idle(counters: &SharedCounters) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while counters.open_requests() > 0 {
        assert!(Instant::now() < deadline, "requests never closed");
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_relays_standard_response_verbatim() {
    let (upstream, _heads) = spawn_upstream(|_| {
        (Duration::ZERO, b"HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\nX-Test: yes\r\n\r\nTest".to_vec())
    })
    .await;
    let (relay, counters, shutdown) = start_relay(relay_config(upstream, 2, 1)).await;

    let response = fetch(relay, "GET /test HTTP/1.0\r\n\r\n").await;
    assert_eq!(response, b"HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\nX-Test: yes\r\n\r\nTest");

    wait_for_idle(&counters).await;
    let snapshot = counters.snapshot();
    assert_eq!(snapshot.request_sequence, 1);
    assert_eq!(snapshot.total_bytes_relayed, 4);

    shutdown.cancel();
}

#[tokio::test]
async fn test_forwards_path_headers_and_version() {
    let (upstream, mut heads) = spawn_upstream(|_| (Duration::ZERO, b"HTTP/1.1 204 No Content\r\n\r\n".to_vec())).await;
    let (relay, _counters, shutdown) = start_relay(relay_config(upstream, 2, 16)).await;

    let response = fetch(
        relay,
        "GET /mount?x=1 HTTP/1.1\r\nHost: relay.local\r\nNtrip-Version: Ntrip/2.0\r\nAuthorization: Basic dTpw\r\n\r\n",
    )
    .await;
    assert_eq!(response, b"HTTP/1.1 204 No Content\r\n\r\n");

    let head = heads.recv().await.unwrap();
    assert!(head.starts_with("GET /mount?x=1 HTTP/1.1\r\n"));
    assert!(head.contains(&format!("Host: 127.0.0.1:{}\r\n", upstream.port())));
    assert!(!head.contains("relay.local"));
    assert!(head.contains("Ntrip-Version: Ntrip/2.0\r\n"));
    assert!(head.contains("Authorization: Basic dTpw\r\n"));

    shutdown.cancel();
}

#[tokio::test]
async fn test_http10_request_goes_upstream_as_http10() {
    let (upstream, mut heads) = spawn_upstream(|_| (Duration::ZERO, b"HTTP/1.0 200 OK\r\n\r\n".to_vec())).await;
    let (relay, _counters, shutdown) = start_relay(relay_config(upstream, 1, 1)).await;

    fetch(relay, "GET /old HTTP/1.0\r\n\r\n").await;
    assert!(heads.recv().await.unwrap().starts_with("GET /old HTTP/1.0\r\n"));

    shutdown.cancel();
}

#[tokio::test]
async fn test_legacy_response_relayed_as_raw_body() {
    let (upstream, _heads) = spawn_upstream(|_| (Duration::ZERO, b"ICY 200 OK\r\n\r\nTest".to_vec())).await;
    let (relay, counters, shutdown) = start_relay(relay_config(upstream, 1, 1)).await;

    let response = fetch(relay, "GET /RTCM3 HTTP/1.0\r\n\r\n").await;
    assert_eq!(response, b"HTTP/1.0 200 OK\r\n\r\nICY 200 OK\r\n\r\nTest");

    wait_for_idle(&counters).await;
    assert_eq!(counters.total_bytes_relayed(), b"ICY 200 OK\r\n\r\nTest".len() as u64);

    shutdown.cancel();
}

#[tokio::test]
async fn test_large_body_streams_in_chunks() {
    let body: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let mut reply = b"HTTP/1.1 200 OK\r\nContent-Length: 10000\r\n\r\n".to_vec();
    reply.extend_from_slice(&body);

    let (upstream, _heads) = spawn_upstream(move |_| (Duration::ZERO, reply.clone())).await;
    let (relay, counters, shutdown) = start_relay(relay_config(upstream, 4, 7)).await;

    let response = fetch(relay, "GET /big HTTP/1.1\r\n\r\n").await;
    let split = response.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
    assert_eq!(&response[split..], &body[..]);

    wait_for_idle(&counters).await;
    assert_eq!(counters.total_bytes_relayed(), 10_000);

    shutdown.cancel();
}

#[tokio::test]
async fn test_non_get_is_rejected_before_forwarding() {
    let (upstream, _heads) = spawn_upstream(|_| (Duration::ZERO, b"HTTP/1.1 200 OK\r\n\r\n".to_vec())).await;
    let (relay, counters, shutdown) = start_relay(relay_config(upstream, 1, 1)).await;

    let response = fetch(relay, "POST /data HTTP/1.1\r\nContent-Length: 0\r\n\r\n").await;
    assert!(response.starts_with(b"HTTP/1.1 501 Not Implemented\r\n"));
    assert_eq!(counters.snapshot().request_sequence, 0);

    let response = fetch(relay, "NOT HTTP AT ALL\r\n\r\n").await;
    assert!(response.starts_with(b"HTTP/1.0 400 Bad Request\r\n"));

    shutdown.cancel();
}

#[tokio::test]
async fn test_refused_upstream_closes_client_and_releases_request() {
    // Grab a free port, then release it so connects are refused.
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream = unused.local_addr().unwrap();
    drop(unused);

    let (relay, counters, shutdown) = start_relay(relay_config(upstream, 1, 1)).await;

    let response = fetch(relay, "GET /a HTTP/1.1\r\n\r\n").await;
    assert!(response.is_empty());

    wait_for_idle(&counters).await;
    assert_eq!(counters.snapshot().request_sequence, 1);

    // The worker survives the failure.
    let response = fetch(relay, "GET /b HTTP/1.1\r\n\r\n").await;
    assert!(response.is_empty());
    wait_for_idle(&counters).await;
    assert_eq!(counters.snapshot().request_sequence, 2);

    shutdown.cancel();
}

async fn race_slow_and_fast(num_threads: usize) -> (Duration, Duration) {
    let (upstream, _heads) = spawn_upstream(|head| {
        let delay = if head.starts_with("GET /a ") { Duration::from_millis(600) } else { Duration::ZERO };
        (delay, b"HTTP/1.0 200 OK\r\n\r\nok".to_vec())
    })
    .await;
    let (relay, _counters, shutdown) = start_relay(relay_config(upstream, num_threads, 1)).await;

    let started = Instant::now();
    let slow = tokio::spawn(async move {
        fetch(relay, "GET /a HTTP/1.0\r\n\r\n").await;
        started.elapsed()
    });
    sleep(Duration::from_millis(100)).await;
    let fast = tokio::spawn(async move {
        fetch(relay, "GET /b HTTP/1.0\r\n\r\n").await;
        started.elapsed()
    });

    let slow = slow.await.unwrap();
    let fast = fast.await.unwrap();
    shutdown.cancel();
    (slow, fast)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_single_worker_serializes_requests() {
    let (slow, fast) = race_slow_and_fast(1).await;
    // /b is only accepted once /a, held upstream for 600ms, has been relayed.
    assert!(slow >= Duration::from_millis(600));
    assert!(fast >= Duration::from_millis(600), "second request finished at {:?}, not gated by the first", fast);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_workers_serve_concurrently() {
    let (slow, fast) = race_slow_and_fast(2).await;
    assert!(fast < slow, "second request finished at {:?}, after the first at {:?}", fast, slow);
}

/// Accepts the response head, then fails every later write with ECONNRESET.
struct ResettingClient {
    writes: usize,
    allowed_writes: usize,
}

impl AsyncWrite for ResettingClient {
    fn poll_write(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if self.writes >= self.allowed_writes {
            return Poll::Ready(Err(io::Error::from(io::ErrorKind::ConnectionReset)));
        }
        self.writes += 1;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[tokio::test]
async fn test_client_reset_is_a_clean_finish() {
    let (upstream, _heads) = spawn_upstream(|_| {
        let mut reply = b"HTTP/1.0 200 OK\r\n\r\n".to_vec();
        reply.extend(std::iter::repeat(b'x').take(64));
        (Duration::ZERO, reply)
    })
    .await;

    let counters = SharedCounters::new();
    let forwarder = RequestForwarder::new(
        Arc::new(relay_config(upstream, 1, 8)),
        counters.clone(),
        CancellationToken::new(),
    );
    let request = parse_request_head(b"GET /stream HTTP/1.0\r\n\r\n").unwrap();
    let mut client = ResettingClient { writes: 0, allowed_writes: 2 };

    let outcome = forwarder.forward(request, &mut client, None).await.unwrap();
    assert_eq!(outcome, ForwardOutcome::ClientDisconnected { bytes: 8 });
    assert_eq!(counters.open_requests(), 0);
}

#[tokio::test]
async fn test_upstream_failure_is_an_error_and_balances_counters() {
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream = unused.local_addr().unwrap();
    drop(unused);

    let counters = SharedCounters::new();
    let forwarder = RequestForwarder::new(
        Arc::new(relay_config(upstream, 1, 8)),
        counters.clone(),
        CancellationToken::new(),
    );
    let request = parse_request_head(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    let mut sink = Vec::new();

    let err = forwarder.forward(request, &mut sink, None).await.unwrap_err();
    assert!(matches!(err, RelayError::Upstream(_)));
    assert!(!err.is_client_disconnect());
    assert_eq!(counters.open_requests(), 0);
    assert!(sink.is_empty());
}

#[tokio::test]
async fn test_content_length_body_ends_without_upstream_close() {
    let upstream = spawn_keepalive_upstream(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nTest".to_vec()).await;
    let (relay, counters, shutdown) = start_relay(relay_config(upstream, 1, 1)).await;

    let response = fetch_within(relay, "GET /a HTTP/1.1\r\n\r\n").await;
    assert_eq!(response, b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nTest");
    wait_for_idle(&counters).await;
    assert_eq!(counters.total_bytes_relayed(), 4);

    // The single worker is free again.
    let response = fetch_within(relay, "GET /b HTTP/1.1\r\n\r\n").await;
    assert!(response.ends_with(b"\r\n\r\nTest"));

    shutdown.cancel();
}

#[tokio::test]
async fn test_chunked_body_relayed_verbatim_and_ends_at_last_chunk() {
    let body = b"4\r\nTest\r\n6;ext=1\r\nstream\r\n0\r\nX-Trailer: done\r\n\r\n";
    let mut reply = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
    reply.extend_from_slice(body);

    let upstream = spawn_keepalive_upstream(reply.clone()).await;
    let (relay, counters, shutdown) = start_relay(relay_config(upstream, 1, 3)).await;

    let response = fetch_within(relay, "GET /chunked HTTP/1.1\r\n\r\n").await;
    assert_eq!(response, reply);

    wait_for_idle(&counters).await;
    assert_eq!(counters.total_bytes_relayed(), body.len() as u64);

    shutdown.cancel();
}

#[tokio::test]
async fn test_shutdown_closes_listener() {
    let (upstream, _heads) = spawn_upstream(|_| (Duration::ZERO, b"HTTP/1.0 200 OK\r\n\r\n".to_vec())).await;
    let relay = Relay::bind(relay_config(upstream, 3, 1)).await.unwrap();
    let addr = relay.local_addr();
    let (shutdown, handle) = relay.spawn();

    fetch(addr, "GET / HTTP/1.0\r\n\r\n").await;
    http_relay::shutdown(&shutdown);
    assert!(handle.await.unwrap().is_ok());

    assert!(TcpStream::connect(addr).await.is_err(), "listener still accepting after shutdown");
}

#[tokio::test]
async fn test_shutdown_closes_listener_with_request_in_flight() {
    // The upstream never answers, so the request stays open.
    let (upstream, _heads) = spawn_upstream(|_| (Duration::from_secs(60), Vec::new())).await;
    let relay = Relay::bind(relay_config(upstream, 2, 1)).await.unwrap();
    let addr = relay.local_addr();
    let counters = relay.counters();
    let (shutdown, handle) = relay.spawn();

    let mut pending = TcpStream::connect(addr).await.unwrap();
    pending.write_all(b"GET /hung HTTP/1.1\r\n\r\n").await.unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while counters.open_requests() == 0 {
        assert!(Instant::now() < deadline, "request never reached the forwarder");
        sleep(Duration::from_millis(10)).await;
    }

    http_relay::shutdown(&shutdown);
    assert!(timeout(Duration::from_secs(3), handle).await.unwrap().unwrap().is_ok());

    assert!(TcpStream::connect(addr).await.is_err(), "listener still accepting after shutdown");
    assert_eq!(counters.open_requests(), 1);
}

#[tokio::test]
async fn test_bind_reports_unresolvable_upstream() {
    let mut config = RelayConfig::new("host.invalid", 2101);
    config.local_port = Some(0);

    let err = Relay::bind(config).await.err().unwrap();
    assert!(matches!(err, RelayError::Resolve { .. }));
    assert_eq!(err.exit_code(), http_relay::error::exit_code::RESOLVE_FAILURE);
}

#[tokio::test]
async fn test_bind_reports_busy_port() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let mut config = RelayConfig::new("127.0.0.1", 9);
    config.local_addr = "127.0.0.1".to_string();
    config.local_port = Some(taken.local_addr().unwrap().port());

    let err = Relay::bind(config).await.err().unwrap();
    assert!(matches!(err, RelayError::Bind { .. }));
    assert_eq!(err.exit_code(), http_relay::error::exit_code::BIND_FAILURE);
}
