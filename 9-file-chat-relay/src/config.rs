use std::{path::PathBuf, time::Duration};

use crate::framer::FrameLimits;

pub const DEFAULT_MAX_CLIENTS: usize = 100;
/// Display names keep at most this many bytes.
pub const DEFAULT_MAX_NAME_LEN: usize = 31;
/// Size of a single transport read; one Text message never exceeds it.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;
pub const DEFAULT_MAX_FILE_SIZE: u64 = 64 * 1024 * 1024;
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Tunables for a running relay.
///
/// Built from the `relay` subcommand arguments, or directly by tests and
/// embedders through [`RelayConfig::default`] plus field updates.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub max_clients: usize,
    pub max_name_len: usize,
    pub read_buffer_size: usize,
    pub max_file_size: u64,
    /// Upper bound for one broadcast write to one peer.
    pub write_timeout: Duration,
    /// Drop connections that stay silent this long. `None` keeps them forever.
    pub idle_timeout: Option<Duration>,
    /// Only a `\n` ends a `FILE:` header.
    pub strict_headers: bool,
    /// Where completed file offers are written.
    pub storage_dir: PathBuf,
}

impl RelayConfig {
    pub fn frame_limits(&self) -> FrameLimits {
        FrameLimits {
            max_file_size: self.max_file_size,
            strict_headers: self.strict_headers,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_clients: DEFAULT_MAX_CLIENTS,
            max_name_len: DEFAULT_MAX_NAME_LEN,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            idle_timeout: None,
            strict_headers: false,
            storage_dir: PathBuf::from("."),
        }
    }
}
