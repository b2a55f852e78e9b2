//! Message transports the connection runs over.
//!
//! A transport moves whole text frames in both directions. Outbound frames are
//! written with [`Transport::send_text`]; inbound frames are pushed to the
//! [`MessageHandler`] given at connect time, on whatever context the transport
//! reads on. Handlers must therefore be cheap and thread-safe.
//!
//! - `websocket`: tokio-tungstenite client used against the real daemon
//! - `memory`: in-process pair with a scriptable peer, for tests and demos

pub mod memory;
pub mod websocket;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::TransportError;

pub use memory::{MemoryConnector, MemoryPeer};
pub use websocket::WebSocketConnector;

/// Something delivered by a transport to its handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
    /// The transport is gone. Carries the reason if it was an error.
    Closed(Option<String>),
}

/// Callback invoked for every inbound frame.
pub type MessageHandler = Arc<dyn Fn(Inbound) + Send + Sync>;

/// An open, full-duplex message transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Writes one text frame. Concurrent callers are serialized.
    async fn send_text(&self, frame: String) -> Result<(), TransportError>;

    /// Releases the transport. Idempotent; later sends fail.
    fn close(&self);
}

/// Opens transports.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        on_message: MessageHandler,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}
