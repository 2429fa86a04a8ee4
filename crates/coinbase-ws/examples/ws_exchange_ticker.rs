//! Streams BTC-USD ticker updates from the public Coinbase Exchange feed.
//!
//! Run with: `cargo run -p coinbase-ws --example ws_exchange_ticker`

use coinbase_ws::{
    CoinbaseAdapter, TopicRequest, WsClient, WsClientConfig, WsEvent, WsKey, WsResult,
};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> WsResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let client = WsClient::new(WsClientConfig::default(), CoinbaseAdapter::new())?;
    let mut events = client.events();

    client
        .subscribe(
            [
                TopicRequest::with_payload("ticker", json!({"product_ids": ["BTC-USD"]})),
                TopicRequest::with_payload("heartbeat", json!({"product_ids": ["BTC-USD"]})),
            ],
            WsKey::ExchangeMarketData,
        )
        .await?;

    let mut updates = 0;
    while let Some(event) = events.recv().await {
        match event {
            WsEvent::Update { event, .. } if event["type"] == "ticker" => {
                println!("{} {}", event["product_id"], event["price"]);
                updates += 1;
                if updates == 10 {
                    break;
                }
            }
            WsEvent::Exception { message, .. } => eprintln!("error: {message}"),
            other => tracing::debug!(?other, "event"),
        }
    }

    client.close_all(false).await
}
