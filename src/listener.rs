use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::forwarder::{ForwardOutcome, RequestForwarder};
use log::{debug, error, info};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream, lookup_host};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const LISTEN_BACKLOG: u32 = 5;

/// Pause after a failed accept so a persistent error (e.g. EMFILE) does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Resolves the upstream once so a bad host fails at startup rather than
/// on the first request.
pub async fn resolve_upstream(config: &RelayConfig) -> Result<SocketAddr, RelayError> {
    let host = config.remote_host();
    let resolve_err = |reason: String| RelayError::Resolve {
        host: host.to_string(),
        reason,
    };

    let mut addrs = lookup_host((host, config.port))
        .await
        .map_err(|e| resolve_err(e.to_string()))?;
    addrs
        .next()
        .ok_or_else(|| resolve_err("no addresses returned".to_string()))
}

/// Binds the shared listening socket with `SO_REUSEADDR` and a backlog of
/// [`LISTEN_BACKLOG`].
pub async fn bind_listener(config: &RelayConfig) -> Result<TcpListener, RelayError> {
    let display = format!("{}:{}", config.local_addr, config.local_port());
    let bind_err = |source: std::io::Error| RelayError::Bind {
        addr: display.clone(),
        source,
    };

    let addr = lookup_host((config.local_host(), config.local_port()))
        .await
        .map_err(bind_err)?
        .next()
        .ok_or_else(|| bind_err(std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "no local address")))?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_err)?;

    socket.set_reuseaddr(true).map_err(bind_err)?;
    socket.bind(addr).map_err(bind_err)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_err)
}

/// The listening socket shared by the accept loops. Dropping the last handle
/// closes the socket and then fires the close notification.
pub struct SharedListener {
    inner: Option<TcpListener>,
    closed: Option<oneshot::Sender<()>>,
}

impl SharedListener {
    fn new(listener: TcpListener) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let shared = Self {
            inner: Some(listener),
            closed: Some(tx),
        };
        (shared, rx)
    }

    pub async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
        match &self.inner {
            Some(listener) => listener.accept().await,
            None => Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "listener closed")),
        }
    }
}

impl Drop for SharedListener {
    fn drop(&mut self) {
        drop(self.inner.take());
        if let Some(closed) = self.closed.take() {
            let _ = closed.send(());
        }
    }
}

/// `num_workers` accept loops sharing one listener. Each loop services its
/// connection to completion before accepting the next one, so the number of
/// in-flight requests never exceeds the number of workers.
pub struct WorkerPool {
    listener: TcpListener,
    forwarder: Arc<RequestForwarder>,
    num_workers: usize,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        listener: TcpListener,
        forwarder: RequestForwarder,
        num_workers: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            listener,
            forwarder: Arc::new(forwarder),
            num_workers: num_workers.max(1),
            shutdown,
        }
    }

    /// Starts the workers. Workers only hold the listener while waiting in
    /// `accept`, so the returned pool owns the socket's lifetime.
    pub fn spawn(self) -> RunningPool {
        let (listener, closed) = SharedListener::new(self.listener);
        let listener = Arc::new(listener);

        let workers = (0..self.num_workers)
            .map(|worker_id| {
                let listener = Arc::downgrade(&listener);
                let forwarder = self.forwarder.clone();
                let shutdown = self.shutdown.clone();
                tokio::spawn(worker_loop(worker_id, listener, forwarder, shutdown))
            })
            .collect();

        RunningPool {
            listener,
            closed,
            workers,
        }
    }
}

pub struct RunningPool {
    listener: Arc<SharedListener>,
    closed: oneshot::Receiver<()>,
    workers: Vec<JoinHandle<()>>,
}

impl RunningPool {
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Closes the listening socket. The shutdown token must already be
    /// cancelled so that workers waiting in `accept` let go of it. Workers
    /// busy with a request are not waited for.
    pub async fn close(self) {
        let RunningPool { listener, closed, workers } = self;
        drop(listener);
        let _ = closed.await;
        debug!("Listener closed, {} workers detached", workers.len());
    }
}

async fn worker_loop(
    worker_id: usize,
    listener: Weak<SharedListener>,
    forwarder: Arc<RequestForwarder>,
    shutdown: CancellationToken,
) {
    debug!("Worker {} accepting connections", worker_id);

    loop {
        let Some(shared) = listener.upgrade() else {
            break;
        };
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = shared.accept() => accepted,
        };
        drop(shared);

        match accepted {
            Ok((stream, peer)) => {
                debug!("Worker {} accepted connection from {}", worker_id, peer);
                let forwarder = forwarder.clone();
                let request = async move { forwarder.serve(stream, Some(peer)).await };
                match serve_isolated(request).await {
                    Some(Ok(ForwardOutcome::Cancelled { .. })) => break,
                    Some(Ok(_)) => {}
                    // Failures are already logged per request; the worker lives on.
                    Some(Err(e)) => debug!("Worker {} request from {} ended with error: {}", worker_id, peer, e),
                    None => error!("Worker {} request handler for {} panicked", worker_id, peer),
                }
            }
            Err(e) => {
                if shutdown.is_cancelled() {
                    break;
                }
                error!("Worker {} failed to accept a connection: {}", worker_id, e);
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }

    info!("Worker {} stopped", worker_id);
}

/// Runs one request on its own task and waits for it, so a panic in the
/// handler ends that request only. Returns `None` if the handler panicked.
async fn serve_isolated<F, T>(request: F) -> Option<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(request).await {
        Ok(result) => Some(result),
        Err(e) if e.is_panic() => None,
        Err(e) => {
            error!("Request task failed: {}", e);
            None
        }
    }
}
