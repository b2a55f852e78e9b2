//! Wire format spoken with the WinMount daemon.
//!
//! A session starts with a plain-text version handshake, after which every
//! frame is a JSON object tagged by `type`. Requests carry a client-assigned
//! `syn` that the daemon echoes in the matching response.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::{Error, Result};

/// Protocol version this client announces.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const CONNECT_PREFIX: &str = "WinMount connect v";
pub const ACCEPT_PREFIX: &str = "WinMount accept v";
pub const REJECT_PREFIX: &str = "WinMount reject v";

/// Method names understood by the daemon.
pub mod method {
    pub const CREATE_FS: &str = "create-fs";
    pub const REMOVE_FS: &str = "remove-fs";
    pub const START_FS: &str = "start-fs";
    pub const STOP_FS: &str = "stop-fs";
    pub const CREATE_FSRV: &str = "create-fsrv";
    pub const REMOVE_FSRV: &str = "remove-fsrv";
    pub const START_FSRV: &str = "start-fsrv";
    pub const STOP_FSRV: &str = "stop-fsrv";
    pub const LIST_FS: &str = "list-fs";
    pub const LIST_FSP: &str = "list-fsp";
    pub const LIST_FSRV: &str = "list-fsrv";
    pub const LIST_FSRVP: &str = "list-fsrvp";
    pub const GET_FS_INFO: &str = "get-fs-info";
    pub const GET_FSRV_INFO: &str = "get-fsrv-info";
    pub const UPDATE_FS_INFO: &str = "update-fs-info";
    pub const UPDATE_FSRV_INFO: &str = "update-fsrv-info";
    pub const CLOSE_CURRENT_SESSION: &str = "close-current-session";
}

/// The first frame a client sends.
pub fn handshake_request() -> String {
    format!("{CONNECT_PREFIX}{CLIENT_VERSION}")
}

/// Outcome of the daemon's answer to the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    /// Carries the daemon's version.
    Accepted(String),
    /// Carries a description of why the session was refused.
    Rejected(String),
}

impl Handshake {
    pub fn parse(frame: &str) -> Self {
        if let Some(version) = frame.strip_prefix(ACCEPT_PREFIX) {
            return Handshake::Accepted(version.to_string());
        }
        match frame.strip_prefix(REJECT_PREFIX) {
            Some(version) => Handshake::Rejected(format!(
                "daemon v{version} does not accept client v{CLIENT_VERSION}"
            )),
            None => Handshake::Rejected(format!("unexpected handshake reply {frame:?}")),
        }
    }
}

/// A response correlated to a request by `syn`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub syn: u64,
    /// Negative codes signal an application error.
    pub code: i32,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub data: Value,
}

impl Response {
    pub fn is_success(&self) -> bool {
        self.code >= 0
    }

    /// Turns a negative status into [`Error::Application`], otherwise yields
    /// the payload.
    pub fn into_result(self) -> Result<Value> {
        if self.is_success() {
            Ok(self.data)
        } else {
            Err(Error::Application {
                code: self.code,
                msg: self.msg,
            })
        }
    }
}

/// Every JSON frame exchanged after the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Request {
        syn: u64,
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
    Response(Response),
    /// Sent by the daemon when it cannot make sense of a request. Has no syn.
    Failure {
        code: i32,
        #[serde(default)]
        msg: String,
    },
    Subscription {
        id: u64,
        name: String,
        #[serde(default)]
        payload: Value,
    },
}

/// Why an inbound frame could not be decoded.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    NotJson(#[source] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame has no \"type\" field")]
    MissingType,
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("malformed {kind} message: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Decodes one text frame.
pub fn decode_frame(text: &str) -> std::result::Result<Message, FrameError> {
    let value: Value = serde_json::from_str(text).map_err(FrameError::NotJson)?;
    let kind = value
        .as_object()
        .ok_or(FrameError::NotAnObject)?
        .get("type")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingType)?
        .to_string();
    if !matches!(
        kind.as_str(),
        "request" | "response" | "failure" | "subscription"
    ) {
        return Err(FrameError::UnknownType(kind));
    }
    serde_json::from_value(value).map_err(|source| FrameError::Malformed { kind, source })
}

/// Encodes a request frame. `params` is left out when absent.
pub fn encode_request(syn: u64, method: &str, params: Option<Value>) -> Result<String> {
    let message = Message::Request {
        syn,
        method: method.to_string(),
        params,
    };
    serde_json::to_string(&message).map_err(Error::Encode)
}
