//! Client library for the WinMount daemon.
//!
//! Speaks the daemon's WebSocket protocol: a version handshake followed by
//! JSON requests and responses correlated by sequence number. Also ships the
//! concurrency primitives the client is built on.
//!
//! ```no_run
//! # async fn demo() -> winmount_client::Result<()> {
//! let client = winmount_client::Client::connect("ws://127.0.0.1:19423/ws").await?;
//! for fs in client.list_fs().await? {
//!     println!("{} {}", fs.id, fs.name);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod rpc;
pub mod sync;
pub mod transport;

pub use error::{Error, Result, TransportError};
pub use rpc::{Client, Connection};
