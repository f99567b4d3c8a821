use crate::config::RelayConfig;
use crate::counters::SharedCounters;
use crate::error::RelayError;
use crate::forwarder::RequestForwarder;
use crate::listener::{WorkerPool, bind_listener, resolve_upstream};
use crate::watchdog::spawn_watchdog;
use log::{debug, info};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// A bound relay, ready to serve.
pub struct Relay {
    config: Arc<RelayConfig>,
    listener: TcpListener,
    counters: Arc<SharedCounters>,
    local_addr: SocketAddr,
}

impl Relay {
    /// Checks that the upstream resolves and binds the local socket.
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        let upstream = resolve_upstream(&config).await?;
        debug!("Upstream {} resolves to {}", config.remote_authority(), upstream);

        let listener = bind_listener(&config).await?;
        let local_addr = listener.local_addr().map_err(|source| RelayError::Bind {
            addr: format!("{}:{}", config.local_addr, config.local_port()),
            source,
        })?;

        Ok(Self {
            config: Arc::new(config),
            listener,
            counters: SharedCounters::new(),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn counters(&self) -> Arc<SharedCounters> {
        self.counters.clone()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Serves until `shutdown` is cancelled, then closes the listening socket
    /// before returning. Workers are not joined: a worker blocked on a slow
    /// upstream read finishes on its own or dies with the process.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), RelayError> {
        let Relay {
            config,
            listener,
            counters,
            local_addr,
        } = self;

        spawn_watchdog(&config, counters.clone());

        info!(
            "Relaying http://{} -> http://{} with {} workers, {} byte chunks",
            local_addr,
            config.remote_authority(),
            config.num_threads,
            config.buffer_size
        );

        let forwarder = RequestForwarder::new(config.clone(), counters, shutdown.clone());
        let pool = WorkerPool::new(listener, forwarder, config.num_threads, shutdown.clone()).spawn();
        debug!("Started {} workers", pool.len());

        shutdown.cancelled().await;
        info!("Relay on {} shutting down", local_addr);
        pool.close().await;
        Ok(())
    }

    /// Runs the relay on a background task, returning the token that stops it.
    pub fn spawn(self) -> (CancellationToken, tokio::task::JoinHandle<Result<(), RelayError>>) {
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(self.run(shutdown.clone()));
        (shutdown, handle)
    }
}

/// Binds and runs a relay until `shutdown` is cancelled.
pub async fn run(config: RelayConfig, shutdown: CancellationToken) -> Result<(), RelayError> {
    Relay::bind(config).await?.run(shutdown).await
}

/// Stops a relay started with [`run`] or [`Relay::run`].
pub fn shutdown(token: &CancellationToken) {
    token.cancel();
}
