//! Error types shared by the relay components.
//!
//! Every per-connection failure ends up as a [`RelayError`] inside that
//! connection's worker. None of them is fatal to the relay process.

use std::{io, time::Duration};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Read, write or connect failure on a transport.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// A `FILE:` header that cannot be parsed.
    #[error("malformed file header: {reason}")]
    MalformedHeader { reason: String },

    /// A file offer announcing more bytes than the relay accepts.
    #[error("file of {size} bytes exceeds the {max} byte limit")]
    FileTooLarge { size: u64, max: u64 },

    #[error("registry is full ({max} clients)")]
    RegistryFull { max: usize },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("write did not complete within {after:?}")]
    WriteTimeout { after: Duration },

    #[error("connection already closed")]
    ConnectionClosed,

    #[error("display name is empty")]
    InvalidName,

    #[error("file offer received before a display name")]
    UnexpectedFileOffer,

    #[error("no data received within {after:?}")]
    IdleTimeout { after: Duration },
}

impl RelayError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedHeader {
            reason: reason.into(),
        }
    }
}

/// Failures of a [`FileSink`](crate::storage::FileSink).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("file name {0:?} has no usable final component")]
    InvalidName(String),

    #[error("failed to write {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
}

pub type Result<T, E = RelayError> = std::result::Result<T, E>;
