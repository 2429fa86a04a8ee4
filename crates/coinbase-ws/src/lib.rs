//! # coinbase-ws
//!
//! WebSocket client core for Coinbase's Advanced Trade, Exchange,
//! International and Prime feeds.
//!
//! ## Features
//!
//! - **Connection registry**: one socket per feed key, opened on demand
//! - **Lifecycle management**: heartbeat, pong deadline and automatic reconnect
//! - **Subscriptions**: desired topics are remembered and replayed after reconnects
//! - **Request correlation**: responses matched to requests by id, with timeouts
//! - **Signing**: HMAC and JWT helpers for private feeds
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use coinbase_ws::{CoinbaseAdapter, WsClient, WsClientConfig, WsKey};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = WsClient::new(WsClientConfig::default(), CoinbaseAdapter::new())?;
//!     client.subscribe(["status"], WsKey::ExchangeMarketData).await?;
//!
//!     let mut events = client.events();
//!     while let Some(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod error;
pub mod websocket;

// Re-export commonly used types
pub use auth::{Credentials, JwtProvider};
pub use error::{WsError, WsResult};
pub use websocket::{
    ConnectionState, EventStream, ExchangeAdapter, TopicRequest, WsClient, WsClientConfig,
    WsEvent, WsKey, WsMessage, handlers::CoinbaseAdapter,
};
