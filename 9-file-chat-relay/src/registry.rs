//! The guarded set of live connections.
//!
//! All bookkeeping happens under one lock and no I/O is ever awaited while it
//! is held. Callers iterate over a [`Registry::snapshot`] instead.

use std::{collections::BTreeMap, fmt, sync::Arc};

use tokio::sync::Mutex;
use tracing::info;

use crate::{
    connection::{BoxedWriter, Connection, ConnectionId, DisplayName},
    error::RelayError,
};

pub struct Registry {
    inner: Mutex<RegistryInner>,
    max_clients: usize,
}

struct RegistryInner {
    connections: BTreeMap<ConnectionId, Arc<Connection>>,
    next_id: ConnectionId,
}

/// Returned by [`Registry::add`] at capacity. Hands the transport back so the
/// caller can close it.
pub struct Rejected {
    pub writer: BoxedWriter,
    pub max: usize,
}

impl From<Rejected> for RelayError {
    fn from(rejected: Rejected) -> Self {
        RelayError::RegistryFull { max: rejected.max }
    }
}

impl fmt::Debug for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected").field("max", &self.max).finish()
    }
}

impl Registry {
    pub fn new(max_clients: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                connections: BTreeMap::new(),
                next_id: 1,
            }),
            max_clients,
        }
    }

    pub fn capacity(&self) -> usize {
        self.max_clients
    }

    /// Registers a named peer under the next id.
    pub async fn add(
        &self,
        name: DisplayName,
        writer: BoxedWriter,
    ) -> Result<Arc<Connection>, Rejected> {
        let mut inner = self.inner.lock().await;
        if inner.connections.len() >= self.max_clients {
            return Err(Rejected {
                writer,
                max: self.max_clients,
            });
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let connection = Arc::new(Connection::new(id, name, writer));
        inner.connections.insert(id, Arc::clone(&connection));

        info!(
            id,
            name = %connection.name(),
            total = inner.connections.len(),
            "client registered"
        );
        Ok(connection)
    }

    /// Removes and closes a connection. Only the first call for an id returns it.
    pub async fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let mut inner = self.inner.lock().await;
        let connection = inner.connections.remove(&id)?;
        connection.close();

        info!(
            id,
            name = %connection.name(),
            total = inner.connections.len(),
            "client removed"
        );
        Some(connection)
    }

    /// Copy of the current entries in id order.
    pub async fn snapshot(&self) -> Vec<Arc<Connection>> {
        let inner = self.inner.lock().await;
        inner.connections.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.connections.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn is_full(&self) -> bool {
        self.len().await >= self.max_clients
    }

    /// Removes and closes every connection, e.g. on shutdown.
    pub async fn close_all(&self) -> Vec<Arc<Connection>> {
        let mut inner = self.inner.lock().await;
        let drained = std::mem::take(&mut inner.connections);
        drained
            .into_values()
            .inspect(|connection| {
                connection.close();
            })
            .collect()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("max_clients", &self.max_clients)
            .finish_non_exhaustive()
    }
}
