//! RPC client for the WinMount daemon.
//!
//! ## Architecture
//!
//! - `protocol`: handshake strings, JSON envelopes and method names
//! - `connection`: handshake plus request/response correlation by syn
//! - `models`: records returned by the daemon
//! - `client`: typed method surface on top of a connection

pub mod client;
pub mod connection;
pub mod models;
pub mod protocol;

pub use client::Client;
pub use connection::{Connection, Phase, ReadResponse};
pub use models::{
    FServerInfo, FServerItem, FServerProviderItem, FileSystemInfo, FileSystemItem,
    FileSystemProviderItem,
};
pub use protocol::{CLIENT_VERSION, Response};
