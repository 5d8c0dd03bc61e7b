//! Text chat relay with in-band file transfer.
//!
//! Clients connect over TCP, send their display name as the first write, and
//! from then on every text they send is relayed to all other participants as
//! `<name>: <text>`. A client may also push a whole file through the same
//! connection with a `FILE:<name>:<size>` header followed by exactly `size`
//! raw bytes; the relay stores it and announces `FILE:<name> is available`.
//!
//! - [`cli`] parses the `relay` and `client` subcommands.
//! - [`config`] holds the relay tunables and their defaults.
//! - [`connection`] defines a peer's name, lifecycle and outbound path.
//! - [`registry`] is the lock-guarded set of live connections.
//! - [`framer`] turns raw reads into text and file messages and back.
//! - [`broadcast`] fans a message out to every peer but its origin.
//! - [`worker`] runs one connection from accept to removal.
//! - [`relay`] accepts TCP clients and owns the worker tasks.
//! - [`storage`] persists completed file offers.
//! - [`client`] is a terminal client for the relay.

pub mod broadcast;
pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod framer;
pub mod registry;
pub mod relay;
pub mod storage;
pub mod worker;
