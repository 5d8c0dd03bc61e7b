//! Fan-out of one message to every registered peer except its origin.

use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use tracing::{debug, warn};

use crate::{connection::ConnectionId, framer::Message, registry::Registry};

/// Outcome of one [`Broadcaster::broadcast`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Peers whose write failed and which were removed as a result.
    pub evicted: Vec<ConnectionId>,
}

#[derive(Debug, Clone)]
pub struct Broadcaster {
    registry: Arc<Registry>,
    write_timeout: Duration,
}

impl Broadcaster {
    pub fn new(registry: Arc<Registry>, write_timeout: Duration) -> Self {
        Self {
            registry,
            write_timeout,
        }
    }

    /// Delivers `message` to every peer in the current snapshot but `origin`.
    ///
    /// Writes run concurrently and each is bounded by the write timeout. A
    /// failed peer is removed from the registry; the others still get the
    /// message. Returns once every peer has been attempted.
    pub async fn broadcast(&self, message: &Message, origin: ConnectionId) -> BroadcastReport {
        let encoded = message.encode();
        let recipients: Vec<_> = self
            .registry
            .snapshot()
            .await
            .into_iter()
            .filter(|connection| connection.id() != origin)
            .collect();

        let results = join_all(recipients.iter().map(|connection| {
            let encoded = &encoded;
            async move {
                let result = connection.send(encoded, self.write_timeout).await;
                (connection, result)
            }
        }))
        .await;

        let mut report = BroadcastReport::default();
        for (connection, result) in results {
            match result {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    warn!(
                        id = connection.id(),
                        name = %connection.name(),
                        error = %err,
                        "failed to deliver message, removing client"
                    );
                    self.registry.remove(connection.id()).await;
                    report.evicted.push(connection.id());
                }
            }
        }

        debug!(
            origin,
            delivered = report.delivered,
            evicted = report.evicted.len(),
            "broadcast complete"
        );
        report
    }
}
