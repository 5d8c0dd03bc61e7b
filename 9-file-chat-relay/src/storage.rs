//! Destinations for completed file offers.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use futures::future::BoxFuture;
use tracing::debug;

use crate::error::StorageError;

/// Receives every file offer a client completes.
pub trait FileSink: Send + Sync {
    /// Persists `payload` under `name` and reports where it went.
    fn store<'a>(
        &'a self,
        name: &'a str,
        payload: &'a [u8],
    ) -> BoxFuture<'a, Result<PathBuf, StorageError>>;
}

/// Writes offers into a single directory, keeping only the final path
/// component of the offered name.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn target(&self, name: &str) -> Result<PathBuf, StorageError> {
        let file_name = Path::new(name)
            .file_name()
            .ok_or_else(|| StorageError::InvalidName(name.to_string()))?;
        Ok(self.root.join(file_name))
    }
}

impl FileSink for DirectorySink {
    fn store<'a>(
        &'a self,
        name: &'a str,
        payload: &'a [u8],
    ) -> BoxFuture<'a, Result<PathBuf, StorageError>> {
        Box::pin(async move {
            let target = self.target(name)?;
            let io_error = |source| StorageError::Io {
                name: name.to_string(),
                source,
            };

            tokio::fs::create_dir_all(&self.root)
                .await
                .map_err(io_error)?;
            tokio::fs::write(&target, payload).await.map_err(io_error)?;

            debug!(path = %target.display(), bytes = payload.len(), "stored file");
            Ok(target)
        })
    }
}

/// Keeps offers in memory, keyed by name. Later offers replace earlier ones.
#[derive(Debug, Default)]
pub struct MemorySink {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.files
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.files
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FileSink for MemorySink {
    fn store<'a>(
        &'a self,
        name: &'a str,
        payload: &'a [u8],
    ) -> BoxFuture<'a, Result<PathBuf, StorageError>> {
        Box::pin(async move {
            self.files
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(name.to_string(), payload.to_vec());
            Ok(PathBuf::from(name))
        })
    }
}
