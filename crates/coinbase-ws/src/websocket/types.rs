//! Core type definitions shared by the connection manager and adapters.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of one logical WebSocket endpoint.
///
/// Every key owns an independent connection, topic set and request table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WsKey {
    /// Advanced Trade public market data.
    AdvTradeMarketData,
    /// Advanced Trade user order and balance updates.
    AdvTradeUserData,
    /// Exchange public feed.
    ExchangeMarketData,
    /// Exchange direct feed (always authenticated).
    ExchangeDirectMarketData,
    /// International Exchange market data.
    InternationalMarketData,
    /// Prime feed.
    PrimeMarketData,
}

impl WsKey {
    /// All known keys, in declaration order.
    pub const ALL: [WsKey; 6] = [
        WsKey::AdvTradeMarketData,
        WsKey::AdvTradeUserData,
        WsKey::ExchangeMarketData,
        WsKey::ExchangeDirectMarketData,
        WsKey::InternationalMarketData,
        WsKey::PrimeMarketData,
    ];

    /// Stable string form used in logs and events.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdvTradeMarketData => "advTradeMarketData",
            Self::AdvTradeUserData => "advTradeUserData",
            Self::ExchangeMarketData => "exchangeMarketData",
            Self::ExchangeDirectMarketData => "exchangeDirectMarketData",
            Self::InternationalMarketData => "internationalMarketData",
            Self::PrimeMarketData => "primeMarketData",
        }
    }
}

impl fmt::Display for WsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection state of a single key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No socket and nothing scheduled.
    #[default]
    Initial,
    /// A socket is being opened.
    Connecting,
    /// The socket is open.
    Connected,
    /// Waiting out the reconnect delay after a close.
    Reconnecting,
    /// Waiting out the reconnect delay after a failed attempt.
    ErrorReconnecting,
    /// A deliberate close is underway.
    Closing,
}

impl ConnectionState {
    /// True while a connection attempt is outstanding, including the
    /// reconnect delay.
    pub fn is_attempt_in_progress(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Reconnecting | Self::ErrorReconnecting
        )
    }

    /// True for either reconnecting flavour.
    pub fn is_reconnecting(&self) -> bool {
        matches!(self, Self::Reconnecting | Self::ErrorReconnecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initial => "initial",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::ErrorReconnecting => "error_reconnecting",
            Self::Closing => "closing",
        };
        f.write_str(s)
    }
}

/// A topic subscription request: topic name plus optional parameters.
///
/// Two requests are the same subscription when their topic names match and
/// their payloads are equal as JSON values.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicRequest {
    /// Topic or channel name.
    pub topic: String,
    /// Extra subscription parameters, e.g. `{"product_ids": ["BTC-USD"]}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl TopicRequest {
    /// A bare topic without parameters.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: None,
        }
    }

    /// A topic with parameters. A JSON `null` payload is treated as absent.
    pub fn with_payload(topic: impl Into<String>, payload: Value) -> Self {
        let payload = match payload {
            Value::Null => None,
            other => Some(other),
        };
        Self {
            topic: topic.into(),
            payload,
        }
    }

    /// Look up a field of the payload object.
    pub fn payload_field(&self, field: &str) -> Option<&Value> {
        self.payload.as_ref().and_then(|p| p.get(field))
    }
}

impl fmt::Display for TopicRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            Some(payload) => write!(f, "{}({})", self.topic, payload),
            None => f.write_str(&self.topic),
        }
    }
}

impl From<&str> for TopicRequest {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TopicRequest {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&TopicRequest> for TopicRequest {
    fn from(request: &TopicRequest) -> Self {
        request.clone()
    }
}

/// Identifier for request-response correlation.
///
/// Allocated from a process-wide counter, see
/// [`next_request_id`](crate::websocket::next_request_id).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    /// Wrap a raw id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw numeric value.
    pub const fn get(&self) -> u64 {
        self.0
    }

    /// Read an id echoed back by a server, either as a number or a numeric
    /// string.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_u64().map(Self),
            Value::String(s) => s.parse().ok().map(Self),
            _ => None,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Subscription direction handed to the batching function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WsOperation {
    Subscribe,
    Unsubscribe,
}

impl WsOperation {
    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

/// Classification of an inbound message after adapter parsing.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum EmittableKind {
    /// Reply to a command (subscribe confirmation, request response).
    Response,
    /// Push data for a subscribed topic.
    Update,
    /// Server side error.
    Exception,
    /// The connection finished authenticating.
    Authenticated,
    /// The server confirmed the connection is ready for traffic.
    ConnectionReady,
    /// Application level heartbeat reply.
    Pong,
    /// Anything else, emitted under its own name.
    Custom(String),
}

impl EmittableKind {
    /// Returns true if this is a response that may resolve a pending request.
    pub fn is_response(&self) -> bool {
        matches!(self, Self::Response)
    }

    /// Returns true if this is an error reply.
    pub fn is_exception(&self) -> bool {
        matches!(self, Self::Exception)
    }
}

/// One event extracted from an inbound message.
#[derive(Clone, Debug, PartialEq)]
pub struct EmittableEvent {
    pub kind: EmittableKind,
    pub event: Value,
    /// Set when the message answers a correlated request.
    pub request_id: Option<RequestId>,
}

impl EmittableEvent {
    pub fn new(kind: EmittableKind, event: Value) -> Self {
        Self {
            kind,
            event,
            request_id: None,
        }
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }
}
