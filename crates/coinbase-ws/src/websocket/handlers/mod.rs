//! Exchange adapter implementations.
//!
//! - [`CoinbaseAdapter`]: Advanced Trade, Exchange, International and Prime
//!   feeds

mod coinbase;

pub use coinbase::{CoinbaseAdapter, PRIVATE_TOPICS, endpoint};
