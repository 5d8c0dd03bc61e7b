use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use clap::{Args, Parser, Subcommand};

use crate::config::{self, RelayConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat relay, accepting TCP clients on PORT.
    Relay(RelayArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RelayArgs {
    /// Port to listen on. Use 0 for an ephemeral port.
    pub port: u16,

    /// Address to bind.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Connections beyond this many are rejected.
    #[arg(long, default_value_t = config::DEFAULT_MAX_CLIENTS)]
    pub max_clients: usize,

    /// Directory receiving uploaded files.
    #[arg(long, default_value = ".")]
    pub storage_dir: PathBuf,

    /// Per-peer write timeout for broadcasts, in milliseconds.
    #[arg(long, default_value_t = 5_000)]
    pub write_timeout_ms: u64,

    /// Disconnect clients that send nothing for this many seconds.
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,

    /// Largest accepted file offer, in bytes.
    #[arg(long, default_value_t = config::DEFAULT_MAX_FILE_SIZE)]
    pub max_file_size: u64,

    /// Require file headers to end with a newline.
    #[arg(long)]
    pub strict_headers: bool,
}

impl RelayArgs {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

impl From<&RelayArgs> for RelayConfig {
    fn from(args: &RelayArgs) -> Self {
        RelayConfig {
            max_clients: args.max_clients,
            max_file_size: args.max_file_size,
            write_timeout: Duration::from_millis(args.write_timeout_ms),
            idle_timeout: args.idle_timeout_secs.map(Duration::from_secs),
            strict_headers: args.strict_headers,
            storage_dir: args.storage_dir.clone(),
            ..RelayConfig::default()
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Name shown to the other participants.
    pub username: String,

    /// Relay host name or address.
    pub host: String,

    /// Relay port.
    pub port: u16,
}
