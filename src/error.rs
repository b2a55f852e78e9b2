//! Error taxonomy for the client.
//!
//! Every fallible operation of the RPC layer and the task abstraction returns
//! [`Error`]. Channel operations never produce an `Error`: disconnection is an
//! expected condition and is reported through return values instead.

use thiserror::Error;

/// Errors raised by a transport implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The transport could not be opened.
    #[error("failed to connect: {0}")]
    Connect(String),
    /// A frame could not be written.
    #[error("failed to send frame: {0}")]
    Send(String),
    /// The transport has already been closed.
    #[error("transport closed")]
    Closed,
}

/// Errors surfaced to callers of the client.
#[derive(Debug, Error)]
pub enum Error {
    /// The daemon did not answer the version handshake with an accept frame.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),
    /// The connection was closed before or while the operation ran.
    #[error("connection closed")]
    ConnectionClosed,
    /// The caller gave up waiting.
    #[error("operation cancelled")]
    Cancelled,
    /// The daemon answered with a negative status code.
    #[error("RPC failed with code {code}: {msg}")]
    Application { code: i32, msg: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode response data: {0}")]
    Decode(#[source] serde_json::Error),
    /// A task body panicked.
    #[error("task panicked: {0}")]
    Panicked(String),
}

impl Error {
    /// True for failures reported by the daemon itself, as opposed to
    /// connectivity or local problems.
    pub fn is_application(&self) -> bool {
        matches!(self, Error::Application { .. })
    }

    /// The daemon's status code, if this is an application error.
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::Application { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
