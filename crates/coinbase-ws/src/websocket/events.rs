//! Typed event bus carrying lifecycle and data events to the application.

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

use super::types::WsKey;

/// Events published by the connection manager.
///
/// Every event names the key it belongs to.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum WsEvent {
    /// First successful open of a key's socket.
    Open { ws_key: WsKey },
    /// The socket reopened after a scheduled reconnect.
    Reconnected { ws_key: WsKey },
    /// The socket dropped unexpectedly; a reconnect has been scheduled.
    Reconnect { ws_key: WsKey },
    /// The socket closed on request and will stay closed.
    Close { ws_key: WsKey },
    /// Reply to a command, e.g. a subscription confirmation.
    Response { ws_key: WsKey, event: Value },
    /// Push data, including any message the adapter did not recognise.
    Update { ws_key: WsKey, event: Value },
    /// Transport failure or error payload from the server.
    Exception {
        ws_key: WsKey,
        message: String,
        event: Option<Value>,
    },
    /// The connection finished authenticating.
    Authenticated { ws_key: WsKey, event: Value },
    /// Adapter specific event, emitted under its own name.
    Message {
        ws_key: WsKey,
        event_type: String,
        event: Value,
    },
}

impl WsEvent {
    pub fn ws_key(&self) -> WsKey {
        match self {
            Self::Open { ws_key }
            | Self::Reconnected { ws_key }
            | Self::Reconnect { ws_key }
            | Self::Close { ws_key }
            | Self::Response { ws_key, .. }
            | Self::Update { ws_key, .. }
            | Self::Exception { ws_key, .. }
            | Self::Authenticated { ws_key, .. }
            | Self::Message { ws_key, .. } => *ws_key,
        }
    }

    /// Short event name, as used in logs.
    pub fn name(&self) -> &str {
        match self {
            Self::Open { .. } => "open",
            Self::Reconnected { .. } => "reconnected",
            Self::Reconnect { .. } => "reconnect",
            Self::Close { .. } => "close",
            Self::Response { .. } => "response",
            Self::Update { .. } => "update",
            Self::Exception { .. } => "exception",
            Self::Authenticated { .. } => "authenticated",
            Self::Message { event_type, .. } => event_type,
        }
    }
}

/// Receiving end of the event bus.
///
/// Slow receivers skip over events they lagged behind on rather than
/// blocking the connection manager.
pub struct EventStream {
    rx: broadcast::Receiver<WsEvent>,
}

impl EventStream {
    pub(crate) fn new(rx: broadcast::Receiver<WsEvent>) -> Self {
        Self { rx }
    }

    /// Receive the next event. Returns `None` once the client is gone.
    pub async fn recv(&mut self) -> Option<WsEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event receiver lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Receive an event if one is ready.
    pub fn try_recv(&mut self) -> Option<WsEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event receiver lagged, events dropped");
                }
                Err(_) => return None,
            }
        }
    }
}
