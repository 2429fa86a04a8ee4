//! Exchange adapter trait for exchange-agnostic connection handling.
//!
//! The [`ExchangeAdapter`] trait abstracts everything the connection manager
//! does not decide itself: endpoint URLs, which keys and topics are private,
//! how subscribe messages are batched and signed, heartbeat framing, and how
//! inbound messages are classified.

use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;

use super::{
    config::WsClientConfig,
    types::{EmittableEvent, RequestId, TopicRequest, WsKey, WsOperation},
};
use crate::error::{WsError, WsResult};

/// Message representation for outbound WebSocket traffic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WsMessage {
    /// Text message.
    Text(String),
    /// Binary message.
    Binary(Vec<u8>),
}

impl WsMessage {
    /// Create a text message.
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// Create a binary message.
    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self::Binary(data.into())
    }

    /// Serialize a JSON value into a text message.
    pub fn json(value: &Value) -> WsResult<Self> {
        Ok(Self::Text(serde_json::to_string(value)?))
    }

    /// Get as text if this is a text message.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Binary(_) => None,
        }
    }

    pub(crate) fn to_frame(&self) -> Message {
        match self {
            Self::Text(text) => Message::Text(text.clone()),
            Self::Binary(data) => Message::Binary(data.clone()),
        }
    }
}

/// Exchange specific behaviour plugged into the connection manager.
///
/// # Example
///
/// ```rust,ignore
/// struct MyExchange;
///
/// impl ExchangeAdapter for MyExchange {
///     fn ws_url(&self, ws_key: WsKey, config: &WsClientConfig) -> WsResult<String> {
///         Ok("wss://stream.example.com".to_string())
///     }
///     // ... other methods
/// }
/// ```
pub trait ExchangeAdapter: Send + Sync + 'static {
    // ========================
    // Endpoints and privacy
    // ========================

    /// Resolve the endpoint URL for a key.
    fn ws_url(&self, ws_key: WsKey, config: &WsClientConfig) -> WsResult<String>;

    /// Whether connections for this key carry private data.
    fn is_private_ws_key(&self, ws_key: WsKey) -> bool;

    /// Whether a topic needs an authenticated connection.
    fn is_private_topic_request(&self, request: &TopicRequest, ws_key: WsKey) -> bool {
        let _ = request;
        self.is_private_ws_key(ws_key)
    }

    // ========================
    // Message Building
    // ========================

    /// Build the wire messages for a (un)subscribe of `topics`, batching them
    /// however the venue allows. Messages are sent in the returned order.
    fn build_operation_messages(
        &self,
        topics: &[TopicRequest],
        ws_key: WsKey,
        operation: WsOperation,
    ) -> WsResult<Vec<WsMessage>>;

    /// Build the authentication request sent on connect, if the venue uses
    /// one. Only called when auth-on-connect is enabled.
    fn build_auth_request(&self, ws_key: WsKey) -> WsResult<Option<WsMessage>> {
        let _ = ws_key;
        Ok(None)
    }

    /// Build an application-level ping message.
    ///
    /// Return `None` to use WebSocket protocol-level pings instead.
    fn build_ping(&self, ws_key: WsKey) -> Option<WsMessage> {
        let _ = ws_key;
        None
    }

    /// Build a response to an application-level server ping.
    fn build_pong(&self, ws_key: WsKey, ping: &str) -> Option<WsMessage> {
        let _ = (ws_key, ping);
        None
    }

    /// Embed a request id into a request payload.
    ///
    /// The default sets an `id` field on JSON objects.
    fn inject_request_id(&self, payload: Value, request_id: RequestId) -> WsResult<WsMessage> {
        match payload {
            Value::Object(mut map) => {
                map.insert("id".to_string(), Value::from(request_id.get()));
                WsMessage::json(&Value::Object(map))
            }
            _ => Err(WsError::internal("request payload must be a JSON object")),
        }
    }

    // ========================
    // Message Processing
    // ========================

    /// Decode binary message to string.
    fn decode_binary(&self, data: &[u8]) -> WsResult<String> {
        String::from_utf8(data.to_vec())
            .map_err(|e| WsError::websocket(format!("non utf-8 binary frame: {e}")))
    }

    /// Check if the message is an application-level server ping.
    fn is_ws_ping(&self, message: &str) -> bool {
        let _ = message;
        false
    }

    /// Check if the message is an application-level pong.
    fn is_ws_pong(&self, message: &str) -> bool {
        let _ = message;
        false
    }

    /// Check if the message asks the client to reconnect.
    fn should_reconnect(&self, message: &str) -> bool {
        let _ = message;
        false
    }

    /// Turn an inbound message into zero or more emittable events.
    ///
    /// An empty result marks the message as unrecognised.
    fn resolve_emittable_events(
        &self,
        ws_key: WsKey,
        message: &str,
    ) -> WsResult<Vec<EmittableEvent>>;
}
