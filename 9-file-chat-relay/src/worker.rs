//! The per-connection control loop.
//!
//! A [`ConnectionWorker`] owns one accepted transport from accept to removal
//! and walks it through [`Lifecycle`]: it reads the display name, registers,
//! relays text and file offers while active, and on any read failure announces
//! the departure and removes itself from the registry.

use std::{io, net::SocketAddr, sync::Arc};

use tokio::{io::AsyncWriteExt, select, time::timeout};
use tracing::{debug, info, warn};

use crate::{
    broadcast::BroadcastReport,
    connection::{BoxedReader, BoxedWriter, Connection, DisplayName, Lifecycle},
    error::{RelayError, Result},
    framer::{FrameReader, Message},
    relay::RelayState,
};

pub struct ConnectionWorker {
    state: Arc<RelayState>,
    reader: FrameReader<BoxedReader>,
    writer: Option<BoxedWriter>,
    peer: Option<SocketAddr>,
    lifecycle: Lifecycle,
}

impl ConnectionWorker {
    pub fn new(
        state: Arc<RelayState>,
        reader: BoxedReader,
        writer: BoxedWriter,
        peer: Option<SocketAddr>,
    ) -> Self {
        let reader = FrameReader::new(
            reader,
            state.config.frame_limits(),
            state.config.read_buffer_size,
        );
        Self {
            state,
            reader,
            writer: Some(writer),
            peer,
            lifecycle: Lifecycle::Connecting,
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Drives the connection until it is removed and returns the final state.
    pub async fn run(mut self) -> Lifecycle {
        self.advance(Lifecycle::Authenticating);

        let Some(connection) = self.authenticate().await else {
            self.advance(Lifecycle::Removed);
            return self.lifecycle;
        };

        self.advance(Lifecycle::Active);
        let joined = format!("{} has joined the chat", connection.name());
        self.announce(&connection, joined).await;

        match self.serve(&connection).await {
            Ok(()) => debug!(id = connection.id(), "client disconnected"),
            Err(err) => {
                info!(id = connection.id(), name = %connection.name(), error = %err, "closing connection")
            }
        }

        self.advance(Lifecycle::Closing);
        let left = format!("{} has left the chat", connection.name());
        self.announce(&connection, left).await;
        self.state.registry.remove(connection.id()).await;

        self.advance(Lifecycle::Removed);
        self.lifecycle
    }

    async fn authenticate(&mut self) -> Option<Arc<Connection>> {
        let name = match self.read_name().await {
            Ok(name) => name,
            Err(err) => {
                debug!(peer = ?self.peer, error = %err, "no display name received");
                return None;
            }
        };

        let writer = self.writer.take()?;
        match self.state.registry.add(name, writer).await {
            Ok(connection) => Some(connection),
            Err(mut rejected) => {
                warn!(
                    peer = ?self.peer,
                    max = rejected.max,
                    "maximum clients reached, connection rejected"
                );
                if let Err(err) = rejected.writer.shutdown().await {
                    debug!(error = ?err, "failed to shut down rejected transport");
                }
                None
            }
        }
    }

    async fn read_name(&mut self) -> Result<DisplayName> {
        match self.next_message().await? {
            Some(Message::Text(body)) => DisplayName::parse(&body, self.state.config.max_name_len),
            Some(Message::FileOffer { .. }) => Err(RelayError::UnexpectedFileOffer),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "closed before sending a name",
            )
            .into()),
        }
    }

    /// Active loop. `Ok` means the peer went away cleanly or was closed by the
    /// relay; any error ends the session as well.
    async fn serve(&mut self, connection: &Arc<Connection>) -> Result<()> {
        loop {
            let message = select! {
                message = self.next_message() => message?,
                () = connection.closed() => {
                    debug!(id = connection.id(), "connection closed by the relay");
                    return Ok(());
                }
            };

            match message {
                Some(message) => self.dispatch(connection, message).await,
                None => return Ok(()),
            }
        }
    }

    async fn dispatch(&mut self, connection: &Arc<Connection>, message: Message) {
        match message {
            Message::Text(body) => {
                let text = String::from_utf8_lossy(trim_line_endings(&body));
                if text.trim().is_empty() {
                    return;
                }

                info!(id = connection.id(), name = %connection.name(), %text, "message");
                let line = format!("{}: {}", connection.name(), text);
                self.announce(connection, line).await;
            }
            Message::FileOffer { name, payload } => {
                match self.state.sink.store(&name, &payload).await {
                    Ok(path) => {
                        info!(
                            id = connection.id(),
                            file = %name,
                            bytes = payload.len(),
                            path = %path.display(),
                            "file transfer completed"
                        );
                        self.announce(connection, format!("FILE:{name} is available"))
                            .await;
                    }
                    Err(err) => {
                        warn!(id = connection.id(), file = %name, error = %err, "file transfer abandoned");
                    }
                }
            }
        }
    }

    async fn next_message(&mut self) -> Result<Option<Message>> {
        match self.state.config.idle_timeout {
            Some(limit) => timeout(limit, self.reader.next_message())
                .await
                .map_err(|_| RelayError::IdleTimeout { after: limit })?,
            None => self.reader.next_message().await,
        }
    }

    async fn announce(&mut self, connection: &Connection, text: String) -> BroadcastReport {
        self.state
            .broadcaster
            .broadcast(&Message::text(text), connection.id())
            .await
    }

    fn advance(&mut self, next: Lifecycle) {
        debug_assert!(
            self.lifecycle.can_advance_to(next),
            "invalid transition {:?} -> {next:?}",
            self.lifecycle
        );
        debug!(peer = ?self.peer, from = ?self.lifecycle, to = ?next, "lifecycle");
        self.lifecycle = next;
    }
}

fn trim_line_endings(body: &[u8]) -> &[u8] {
    let end = body
        .iter()
        .rposition(|b| !matches!(b, b'\r' | b'\n'))
        .map_or(0, |last| last + 1);
    &body[..end]
}
