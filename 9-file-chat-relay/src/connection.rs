//! Per-peer state: identity, display name, lifecycle tag and outbound path.

use std::{fmt, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::{Mutex, watch},
    time::timeout,
};

use crate::error::{RelayError, Result};

pub type ConnectionId = u64;

/// Read half of an accepted transport, type-erased so tests can use duplex pipes.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A peer's name as shown to everyone else, bounded in bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DisplayName(String);

impl DisplayName {
    /// Builds a name from the first bytes a client sends.
    ///
    /// Surrounding whitespace is dropped and the result is cut to `max_len`
    /// bytes without splitting a character. Invalid UTF-8 is replaced.
    pub fn parse(raw: &[u8], max_len: usize) -> Result<Self> {
        let text = String::from_utf8_lossy(raw);
        let trimmed = text.trim();

        let mut end = trimmed.len().min(max_len);
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }

        let name = trimmed[..end].trim_end();
        if name.is_empty() {
            return Err(RelayError::InvalidName);
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DisplayName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a connection is in its life. Only the owning worker moves it forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Accepted, not registered yet.
    Connecting,
    /// Waiting for the display name.
    Authenticating,
    /// Registered and relaying messages.
    Active,
    /// Announcing departure and leaving the registry.
    Closing,
    Removed,
}

impl Lifecycle {
    pub fn can_advance_to(self, next: Lifecycle) -> bool {
        use Lifecycle::*;

        matches!(
            (self, next),
            (Connecting, Authenticating)
                | (Authenticating, Active)
                | (Authenticating, Removed)
                | (Active, Closing)
                | (Closing, Removed)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == Lifecycle::Removed
    }
}

/// A registered peer as seen by the registry and the broadcaster.
///
/// The write half lives behind its own lock so that broadcasts coming from
/// different origins are written one whole message at a time.
pub struct Connection {
    id: ConnectionId,
    name: DisplayName,
    writer: Mutex<BoxedWriter>,
    closed: watch::Sender<bool>,
}

impl Connection {
    pub(crate) fn new(id: ConnectionId, name: DisplayName, writer: BoxedWriter) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id,
            name,
            writer: Mutex::new(writer),
            closed,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn name(&self) -> &DisplayName {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Marks the transport closed. Returns `false` if it already was.
    pub(crate) fn close(&self) -> bool {
        !self.closed.send_replace(true)
    }

    /// Resolves once the connection has been closed through the registry.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Writes `bytes` to the peer, giving up after `limit`.
    pub async fn send(&self, bytes: &[u8], limit: Duration) -> Result<()> {
        if self.is_closed() {
            return Err(RelayError::ConnectionClosed);
        }

        let mut writer = self.writer.lock().await;
        let write = async {
            writer.write_all(bytes).await?;
            writer.flush().await
        };

        match timeout(limit, write).await {
            Ok(result) => result.map_err(RelayError::from),
            Err(_) => Err(RelayError::WriteTimeout { after: limit }),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}
