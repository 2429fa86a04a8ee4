//! WebSocket connection management for Coinbase feeds.
//!
//! This module provides:
//!
//! - **One connection per [`WsKey`]**: each feed endpoint gets its own socket,
//!   opened lazily and never duplicated, even under concurrent connects
//! - **Desired-state subscriptions**: topics are recorded per key and replayed
//!   whenever the connection (re)opens
//! - **Heartbeat and reconnect**: pings on an interval, a pong deadline, and a
//!   fixed-delay reconnect after any unexpected close
//! - **Request correlation**: process-wide request ids matched against
//!   responses, with timeouts and rejection when a socket drops
//! - **Exchange abstraction**: venue specifics live behind [`ExchangeAdapter`]
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐ commands ┌─────────────────┐  frames  ┌──────────────┐
//! │  WsClient   │─────────▶│ ConnectionActor │◀────────▶│   Coinbase   │
//! │  (Clone)    │          │   (Background)  │          │   feeds      │
//! └─────────────┘          └───────┬─────────┘          └──────────────┘
//!        ▲                         │
//!        │ WsEvent                 ▼
//! ┌──────┴──────┐          ┌─────────────────┐
//! │ EventStream │◀─────────│     WsStore     │
//! │ (broadcast) │          │ (per-key state) │
//! └─────────────┘          └─────────────────┘
//! ```
//!
//! The actor is the only owner of connection state. Reader tasks, connect
//! tasks and timers report back to it through an internal channel, tagged
//! so that reports from a replaced socket or a cancelled timer are ignored.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use coinbase_ws::websocket::{
//!     TopicRequest, WsClient, WsClientConfig, WsKey, handlers::CoinbaseAdapter,
//! };
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = WsClient::new(WsClientConfig::default(), CoinbaseAdapter::new())?;
//!     let mut events = client.events();
//!
//!     client
//!         .subscribe(
//!             [TopicRequest::with_payload(
//!                 "ticker",
//!                 json!({"product_ids": ["BTC-USD"]}),
//!             )],
//!             WsKey::ExchangeMarketData,
//!         )
//!         .await?;
//!
//!     while let Some(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Configuration
//!
//! | Setting | Default | Description |
//! |---------|---------|-------------|
//! | `ping_interval` | 10s | Interval between heartbeat pings |
//! | `pong_timeout` | 1s | Max wait for any frame after a ping |
//! | `reconnect_timeout` | 500ms | Delay before reopening a dropped socket |
//! | `connect_timeout` | 10s | Max time to open a socket |
//! | `request_timeout` | 30s | Default request-response timeout |
//! | `max_pending_requests` | 1000 | Pending requests per connection |
//!
//! # Errors
//!
//! Operations return [`WsResult<T>`](crate::error::WsResult). Pending work
//! on a dropped socket fails with
//! [`WsError::ConnectionLost`](crate::error::WsError::ConnectionLost); after
//! a deliberate close it fails with
//! [`WsError::Disconnected`](crate::error::WsError::Disconnected).

mod actor;
mod config;
mod coordinator;
mod correlator;
mod deferred;
mod events;
pub mod handlers;
mod pending;
mod protocol;
mod store;
mod subscription;
mod transport;
mod types;
mod ws_client;

pub use actor::ConnectionSnapshot;
pub use config::WsClientConfig;
pub use correlator::next_request_id;
pub use deferred::Deferred;
pub use events::{EventStream, WsEvent};
pub use pending::{PendingRequest, PendingRequests, Responder};
pub use protocol::{ExchangeAdapter, WsMessage};
pub use store::{WsConnection, WsStore};
pub use subscription::TopicSet;
pub use transport::{
    ConnectionEpoch, Connector, SocketHandle, TungsteniteConnector, WsSink, WsStream,
};
pub use types::{
    ConnectionState, EmittableEvent, EmittableKind, RequestId, TopicRequest, WsKey, WsOperation,
};
pub use ws_client::WsClient;
