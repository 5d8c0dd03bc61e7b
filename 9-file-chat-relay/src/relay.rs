use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    task::{JoinError, JoinSet},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    broadcast::Broadcaster,
    config::RelayConfig,
    connection::Lifecycle,
    registry::Registry,
    storage::{DirectorySink, FileSink},
    worker::ConnectionWorker,
};

/// How long workers get to wind down after shutdown before they are aborted.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Accepts TCP clients and runs one [`ConnectionWorker`] per connection.
pub struct Relay {
    listener: TcpListener,
    state: Arc<RelayState>,
}

impl Relay {
    /// A relay that stores file offers under `config.storage_dir`.
    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        let sink = Arc::new(DirectorySink::new(config.storage_dir.clone()));
        Self::with_sink(listener, config, sink)
    }

    pub fn with_sink(listener: TcpListener, config: RelayConfig, sink: Arc<dyn FileSink>) -> Self {
        Self {
            listener,
            state: Arc::new(RelayState::new(config, sink)),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.state.registry)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay { listener, state } = self;
        let mut workers = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state, &mut workers).await;
                }
                Some(finished) = workers.join_next(), if !workers.is_empty() => {
                    log_worker_exit(finished);
                }
            }
        }

        drop(listener);
        handle_shutdown(&state, workers).await;
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// State shared by every worker of one relay.
pub struct RelayState {
    pub(crate) config: RelayConfig,
    pub(crate) registry: Arc<Registry>,
    pub(crate) broadcaster: Broadcaster,
    pub(crate) sink: Arc<dyn FileSink>,
}

impl RelayState {
    pub fn new(config: RelayConfig, sink: Arc<dyn FileSink>) -> Self {
        let registry = Arc::new(Registry::new(config.max_clients));
        let broadcaster = Broadcaster::new(Arc::clone(&registry), config.write_timeout);
        Self {
            config,
            registry,
            broadcaster,
            sink,
        }
    }
}

async fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<RelayState>,
    workers: &mut JoinSet<Lifecycle>,
) {
    match result {
        Ok((stream, peer)) => {
            while let Some(finished) = workers.try_join_next() {
                log_worker_exit(finished);
            }
            // Workers still waiting for a name hold a socket too.
            let max = state.registry.capacity();
            if workers.len() >= max || state.registry.is_full().await {
                warn!(
                    peer = %peer,
                    max,
                    pending = workers.len(),
                    "maximum clients reached, connection rejected"
                );
                return;
            }
            let registered = state.registry.len().await;
            info!(peer = %peer, registered, "client connected");
            spawn_worker(stream, peer, state, workers);
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_worker(
    stream: TcpStream,
    peer: SocketAddr,
    state: &Arc<RelayState>,
    workers: &mut JoinSet<Lifecycle>,
) {
    let (reader, writer) = stream.into_split();
    let worker = ConnectionWorker::new(
        Arc::clone(state),
        Box::new(reader),
        Box::new(writer),
        Some(peer),
    );
    workers.spawn(worker.run());
}

fn log_worker_exit(result: Result<Lifecycle, JoinError>) {
    match result {
        Ok(lifecycle) => debug!(?lifecycle, "worker finished"),
        Err(err) => warn!(error = ?err, "worker task failed"),
    }
}

async fn handle_shutdown(state: &RelayState, mut workers: JoinSet<Lifecycle>) {
    info!("relay shutting down");
    let closed = state.registry.close_all().await;
    debug!(clients = closed.len(), "closed registered clients");
    drop(closed);

    let drained = timeout(SHUTDOWN_GRACE, async {
        while let Some(finished) = workers.join_next().await {
            log_worker_exit(finished);
        }
    })
    .await;

    if drained.is_err() {
        warn!(remaining = workers.len(), "aborting workers after grace period");
        workers.shutdown().await;
    }
}
