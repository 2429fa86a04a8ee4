//! Error handling for the WebSocket client.

use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::websocket::{RequestId, WsKey};

/// The main result type used throughout the crate.
pub type WsResult<T> = Result<T, WsError>;

/// Error type for all connection, subscription and request operations.
#[derive(Error, Debug)]
pub enum WsError {
    /// Transport level failure reported by the socket.
    #[error("WebSocket error: {message}")]
    WebSocket { message: String },

    /// The server answered the upgrade request with a non-101 status.
    #[error("Unexpected server response: {status}")]
    Handshake { status: u16 },

    /// Authentication and signing errors
    #[error("Authentication error: {message}")]
    Auth { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Timeout errors
    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// The socket closed underneath an operation and will be reopened.
    #[error("connection lost, reconnecting: {ws_key}")]
    ConnectionLost { ws_key: WsKey },

    /// The connection was closed on request and will not be reopened.
    #[error("disconnected: {ws_key}")]
    Disconnected { ws_key: WsKey },

    /// No open socket exists for the key.
    #[error("not connected: {ws_key}")]
    NotConnected { ws_key: WsKey },

    /// A correlated request did not get its response in time.
    #[error("Request {request_id} timed out after {duration:?}")]
    RequestTimeout {
        duration: Duration,
        request_id: RequestId,
    },

    /// The server answered a correlated request with an error payload.
    #[error("Request {request_id} rejected: {event}")]
    RequestRejected {
        request_id: RequestId,
        event: serde_json::Value,
    },

    /// Too many requests in flight for one connection.
    #[error("Capacity exceeded: {message}")]
    CapacityExceeded { message: String },

    /// The connection manager task is gone.
    #[error("Client closed")]
    ClientClosed,

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl From<tungstenite::Error> for WsError {
    fn from(e: tungstenite::Error) -> Self {
        match e {
            tungstenite::Error::Http(response) => Self::Handshake {
                status: response.status().as_u16(),
            },
            other => Self::WebSocket {
                message: other.to_string(),
            },
        }
    }
}

impl From<base64::DecodeError> for WsError {
    fn from(e: base64::DecodeError) -> Self {
        Self::Auth {
            message: format!("invalid base64 secret: {e}"),
        }
    }
}

impl WsError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an authentication error.
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a WebSocket error.
    pub fn websocket(message: impl Into<String>) -> Self {
        Self::WebSocket {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// Create a request timeout error.
    pub fn request_timeout(duration: Duration, request_id: RequestId) -> Self {
        Self::RequestTimeout {
            duration,
            request_id,
        }
    }

    /// Create a capacity exceeded error.
    pub fn capacity_exceeded(message: impl Into<String>) -> Self {
        Self::CapacityExceeded {
            message: message.into(),
        }
    }

    /// True when the upgrade was refused with HTTP 401.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Handshake { status: 401 })
    }
}
