//! Coinbase adapter covering the Advanced Trade, Exchange, International
//! and Prime feeds.

use serde_json::{Map, Value, json};

use crate::{
    auth::{
        Credentials, PrimeSignParams, exchange_ws_signature, international_ws_signature,
        prime_ws_signature, timestamp_secs,
    },
    error::{WsError, WsResult},
    websocket::{
        config::WsClientConfig,
        protocol::{ExchangeAdapter, WsMessage},
        types::{EmittableEvent, EmittableKind, RequestId, TopicRequest, WsKey, WsOperation},
    },
};

/// Topics that need credentials even on a public key.
pub const PRIVATE_TOPICS: &[&str] = &["user", "futures_balance_summary"];

/// Livenet and sandbox endpoints of a key. Not every feed has a sandbox.
pub fn endpoint(ws_key: WsKey, sandbox: bool) -> Option<&'static str> {
    let (livenet, testnet) = match ws_key {
        WsKey::AdvTradeMarketData => ("wss://advanced-trade-ws.coinbase.com", None),
        WsKey::AdvTradeUserData => ("wss://advanced-trade-ws-user.coinbase.com", None),
        WsKey::ExchangeMarketData => (
            "wss://ws-feed.exchange.coinbase.com",
            Some("wss://ws-feed-public.sandbox.exchange.coinbase.com"),
        ),
        WsKey::ExchangeDirectMarketData => (
            "wss://ws-direct.exchange.coinbase.com",
            Some("wss://ws-direct.sandbox.exchange.coinbase.com"),
        ),
        WsKey::InternationalMarketData => (
            "wss://ws-md.international.coinbase.com",
            Some("wss://ws-md.n5e2.coinbase.com"),
        ),
        WsKey::PrimeMarketData => ("wss://ws-feed.prime.coinbase.com", None),
    };
    if sandbox { testnet } else { Some(livenet) }
}

/// [`ExchangeAdapter`] for Coinbase WebSocket feeds.
///
/// Public market data works without credentials. Private keys and private
/// topics sign each subscribe message with the configured [`Credentials`].
#[derive(Debug, Clone, Default)]
pub struct CoinbaseAdapter {
    credentials: Option<Credentials>,
}

impl CoinbaseAdapter {
    /// Adapter for public feeds only.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(credentials: Credentials) -> Self {
        Self {
            credentials: Some(credentials),
        }
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    fn require_credentials(&self, ws_key: WsKey) -> WsResult<&Credentials> {
        self.credentials
            .as_ref()
            .ok_or_else(|| WsError::auth(format!("credentials are required for {ws_key}")))
    }

    fn needs_signing(&self, topics: &[TopicRequest], ws_key: WsKey) -> bool {
        self.is_private_ws_key(ws_key)
            || topics
                .iter()
                .any(|topic| self.is_private_topic_request(topic, ws_key))
    }

    /// `{"type": op, "channels": [{"name": topic, ..payload}]}`, signed when
    /// anything in it is private.
    fn exchange_messages(
        &self,
        topics: &[TopicRequest],
        ws_key: WsKey,
        operation: WsOperation,
    ) -> WsResult<Vec<WsMessage>> {
        let channels = topics
            .iter()
            .map(|topic| {
                let mut channel = payload_object(topic)?;
                channel.insert("name".to_string(), Value::from(topic.topic.as_str()));
                Ok(Value::Object(channel))
            })
            .collect::<WsResult<Vec<_>>>()?;

        let mut request = Map::new();
        request.insert("type".to_string(), Value::from(operation.as_str()));
        request.insert("channels".to_string(), Value::Array(channels));

        if self.needs_signing(topics, ws_key) {
            let credentials = self.require_credentials(ws_key)?;
            let timestamp = timestamp_secs()?;
            let signature = exchange_ws_signature(&credentials.api_secret, &timestamp)?;
            request.insert("key".to_string(), Value::from(credentials.api_key.as_str()));
            request.insert(
                "passphrase".to_string(),
                Value::from(credentials.passphrase()?),
            );
            request.insert("signature".to_string(), Value::from(signature));
            request.insert("timestamp".to_string(), Value::from(timestamp));
        }

        Ok(vec![WsMessage::json(&Value::Object(request))?])
    }

    /// One `{"type": op, "channel": topic, ..payload}` per topic, with a JWT
    /// on private topics.
    fn advanced_trade_messages(
        &self,
        topics: &[TopicRequest],
        ws_key: WsKey,
        operation: WsOperation,
    ) -> WsResult<Vec<WsMessage>> {
        topics
            .iter()
            .map(|topic| {
                let mut request = payload_object(topic)?;
                request.insert("type".to_string(), Value::from(operation.as_str()));
                request.insert("channel".to_string(), Value::from(topic.topic.as_str()));
                if self.is_private_topic_request(topic, ws_key) {
                    let jwt = self.require_credentials(ws_key)?.jwt()?;
                    request.insert("jwt".to_string(), Value::from(jwt));
                }
                WsMessage::json(&Value::Object(request))
            })
            .collect()
    }

    /// A single signed `SUBSCRIBE`/`UNSUBSCRIBE` carrying every channel and
    /// the union of their product ids.
    fn international_messages(
        &self,
        topics: &[TopicRequest],
        ws_key: WsKey,
        operation: WsOperation,
    ) -> WsResult<Vec<WsMessage>> {
        let credentials = self.require_credentials(ws_key)?;
        let passphrase = credentials.passphrase()?;
        let timestamp = timestamp_secs()?;
        let signature = international_ws_signature(
            &credentials.api_key,
            &credentials.api_secret,
            passphrase,
            &timestamp,
        )?;

        let channels: Vec<&str> = topics.iter().map(|t| t.topic.as_str()).collect();
        let mut product_ids: Vec<String> = Vec::new();
        for topic in topics {
            for id in product_ids_of(topic) {
                if !product_ids.contains(&id) {
                    product_ids.push(id);
                }
            }
        }

        let request = json!({
            "type": operation.as_str().to_uppercase(),
            "channels": channels,
            "product_ids": product_ids,
            "time": timestamp,
            "key": credentials.api_key,
            "passphrase": passphrase,
            "signature": signature,
        });
        Ok(vec![WsMessage::json(&request)?])
    }

    /// Prime signs every channel separately.
    fn prime_messages(
        &self,
        topics: &[TopicRequest],
        ws_key: WsKey,
        operation: WsOperation,
    ) -> WsResult<Vec<WsMessage>> {
        let credentials = self.require_credentials(ws_key)?;
        let passphrase = credentials.passphrase()?;
        let svc_account_id = credentials.svc_account_id()?;

        topics
            .iter()
            .map(|topic| {
                let portfolio_id = topic
                    .payload_field("portfolio_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let product_ids = product_ids_of(topic);
                let timestamp = timestamp_secs()?;
                let signature = prime_ws_signature(
                    PrimeSignParams {
                        channel: &topic.topic,
                        api_key: &credentials.api_key,
                        secret: &credentials.api_secret,
                        svc_account_id,
                        portfolio_id,
                        product_ids: &product_ids,
                    },
                    &timestamp,
                )?;

                let request = json!({
                    "type": operation.as_str(),
                    "channel": topic.topic,
                    "access_key": credentials.api_key,
                    "api_key_id": svc_account_id,
                    "timestamp": timestamp,
                    "passphrase": passphrase,
                    "signature": signature,
                    "portfolio_id": portfolio_id,
                    "product_ids": product_ids,
                });
                WsMessage::json(&request)
            })
            .collect()
    }
}

impl ExchangeAdapter for CoinbaseAdapter {
    fn ws_url(&self, ws_key: WsKey, config: &WsClientConfig) -> WsResult<String> {
        if let Some(url) = &config.ws_url {
            return Ok(url.clone());
        }
        endpoint(ws_key, config.use_sandbox)
            .map(str::to_string)
            .ok_or_else(|| WsError::config(format!("{ws_key} has no sandbox endpoint")))
    }

    fn is_private_ws_key(&self, ws_key: WsKey) -> bool {
        matches!(
            ws_key,
            WsKey::AdvTradeUserData
                | WsKey::ExchangeDirectMarketData
                | WsKey::InternationalMarketData
                | WsKey::PrimeMarketData
        )
    }

    fn is_private_topic_request(&self, request: &TopicRequest, ws_key: WsKey) -> bool {
        self.is_private_ws_key(ws_key) || PRIVATE_TOPICS.contains(&request.topic.as_str())
    }

    fn build_operation_messages(
        &self,
        topics: &[TopicRequest],
        ws_key: WsKey,
        operation: WsOperation,
    ) -> WsResult<Vec<WsMessage>> {
        if topics.is_empty() {
            return Ok(Vec::new());
        }
        match ws_key {
            WsKey::ExchangeMarketData | WsKey::ExchangeDirectMarketData => {
                self.exchange_messages(topics, ws_key, operation)
            }
            WsKey::AdvTradeMarketData | WsKey::AdvTradeUserData => {
                self.advanced_trade_messages(topics, ws_key, operation)
            }
            WsKey::InternationalMarketData => self.international_messages(topics, ws_key, operation),
            WsKey::PrimeMarketData => self.prime_messages(topics, ws_key, operation),
        }
    }

    fn resolve_emittable_events(
        &self,
        _ws_key: WsKey,
        message: &str,
    ) -> WsResult<Vec<EmittableEvent>> {
        let event: Value = serde_json::from_str(message)?;
        if !event.is_object() {
            return Ok(Vec::new());
        }

        let message_type = event.get("type").and_then(Value::as_str);
        let channel = event.get("channel").and_then(Value::as_str);
        let kind = match (message_type, channel) {
            (Some("error" | "REJECT"), _) => EmittableKind::Exception,
            (Some("subscriptions" | "SUBSCRIPTIONS"), _) | (_, Some("subscriptions")) => {
                EmittableKind::Response
            }
            _ => EmittableKind::Update,
        };

        let request_id = match kind {
            EmittableKind::Response | EmittableKind::Exception => {
                event.get("id").and_then(RequestId::from_value)
            }
            _ => None,
        };
        let emittable = EmittableEvent::new(kind, event);
        Ok(vec![match request_id {
            Some(id) => emittable.with_request_id(id),
            None => emittable,
        }])
    }
}

/// The topic payload as a JSON object; absent payloads are empty.
fn payload_object(topic: &TopicRequest) -> WsResult<Map<String, Value>> {
    match &topic.payload {
        None => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(_) => Err(WsError::config(format!(
            "payload of topic {} must be a JSON object",
            topic.topic
        ))),
    }
}

fn product_ids_of(topic: &TopicRequest) -> Vec<String> {
    topic
        .payload_field("product_ids")
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "Y29pbmJhc2UtdGVzdC1zZWNyZXQ=";

    fn signed_adapter() -> CoinbaseAdapter {
        CoinbaseAdapter::with_credentials(
            Credentials::new("my-key", SECRET)
                .with_passphrase("my-pass")
                .with_svc_account_id("svc-1")
                .with_jwt_provider(|| Ok::<_, WsError>("jwt-token".to_string())),
        )
    }

    fn parse(message: &WsMessage) -> Value {
        serde_json::from_str(message.as_text().unwrap()).unwrap()
    }

    fn ticker(products: &[&str]) -> TopicRequest {
        TopicRequest::with_payload("ticker", json!({ "product_ids": products }))
    }

    #[test]
    fn test_ws_urls() {
        let adapter = CoinbaseAdapter::new();
        let live = WsClientConfig::default();
        assert_eq!(
            adapter.ws_url(WsKey::ExchangeMarketData, &live).unwrap(),
            "wss://ws-feed.exchange.coinbase.com"
        );

        let sandbox = WsClientConfig::default().use_sandbox(true);
        assert_eq!(
            adapter.ws_url(WsKey::InternationalMarketData, &sandbox).unwrap(),
            "wss://ws-md.n5e2.coinbase.com"
        );
        assert!(matches!(
            adapter.ws_url(WsKey::PrimeMarketData, &sandbox),
            Err(WsError::Config { .. })
        ));

        let overridden = WsClientConfig::default().ws_url("ws://127.0.0.1:9000");
        assert_eq!(
            adapter.ws_url(WsKey::PrimeMarketData, &overridden).unwrap(),
            "ws://127.0.0.1:9000"
        );
    }

    #[test]
    fn test_privacy() {
        let adapter = CoinbaseAdapter::new();
        assert!(!adapter.is_private_ws_key(WsKey::ExchangeMarketData));
        assert!(adapter.is_private_ws_key(WsKey::ExchangeDirectMarketData));
        assert!(adapter.is_private_topic_request(&"user".into(), WsKey::AdvTradeMarketData));
        assert!(!adapter.is_private_topic_request(&"ticker".into(), WsKey::AdvTradeMarketData));
        assert!(adapter.is_private_topic_request(&"ticker".into(), WsKey::PrimeMarketData));
    }

    #[test]
    fn test_exchange_public_topics_merge() {
        let adapter = CoinbaseAdapter::new();
        let topics = vec![ticker(&["BTC-USD"]), TopicRequest::new("heartbeat")];
        let messages = adapter
            .build_operation_messages(&topics, WsKey::ExchangeMarketData, WsOperation::Subscribe)
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(
            parse(&messages[0]),
            json!({
                "type": "subscribe",
                "channels": [
                    {"name": "ticker", "product_ids": ["BTC-USD"]},
                    {"name": "heartbeat"}
                ]
            })
        );
    }

    #[test]
    fn test_exchange_private_key_is_signed() {
        let adapter = signed_adapter();
        let messages = adapter
            .build_operation_messages(
                &[ticker(&["ETH-USD"])],
                WsKey::ExchangeDirectMarketData,
                WsOperation::Unsubscribe,
            )
            .unwrap();
        let request = parse(&messages[0]);
        assert_eq!(request["type"], "unsubscribe");
        assert_eq!(request["key"], "my-key");
        assert_eq!(request["passphrase"], "my-pass");
        let timestamp = request["timestamp"].as_str().unwrap();
        assert_eq!(
            request["signature"].as_str().unwrap(),
            exchange_ws_signature(SECRET, timestamp).unwrap()
        );
    }

    #[test]
    fn test_private_without_credentials_fails() {
        let adapter = CoinbaseAdapter::new();
        let result = adapter.build_operation_messages(
            &["full".into()],
            WsKey::ExchangeDirectMarketData,
            WsOperation::Subscribe,
        );
        assert!(matches!(result, Err(WsError::Auth { .. })));
    }

    #[test]
    fn test_advanced_trade_one_message_per_topic() {
        let adapter = signed_adapter();
        let topics = vec![ticker(&["BTC-USD"]), TopicRequest::new("user")];
        let messages = adapter
            .build_operation_messages(&topics, WsKey::AdvTradeMarketData, WsOperation::Subscribe)
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(
            parse(&messages[0]),
            json!({"type": "subscribe", "channel": "ticker", "product_ids": ["BTC-USD"]})
        );
        assert_eq!(
            parse(&messages[1]),
            json!({"type": "subscribe", "channel": "user", "jwt": "jwt-token"})
        );
    }

    #[test]
    fn test_international_merges_channels_and_products() {
        let adapter = signed_adapter();
        let topics = vec![
            ticker(&["BTC-PERP"]),
            TopicRequest::with_payload("LEVEL1", json!({"product_ids": ["BTC-PERP", "ETH-PERP"]})),
        ];
        let messages = adapter
            .build_operation_messages(
                &topics,
                WsKey::InternationalMarketData,
                WsOperation::Subscribe,
            )
            .unwrap();
        assert_eq!(messages.len(), 1);
        let request = parse(&messages[0]);
        assert_eq!(request["type"], "SUBSCRIBE");
        assert_eq!(request["channels"], json!(["ticker", "LEVEL1"]));
        assert_eq!(request["product_ids"], json!(["BTC-PERP", "ETH-PERP"]));
        let time = request["time"].as_str().unwrap();
        assert_eq!(
            request["signature"].as_str().unwrap(),
            international_ws_signature("my-key", SECRET, "my-pass", time).unwrap()
        );
    }

    #[test]
    fn test_prime_signs_each_topic() {
        let adapter = signed_adapter();
        let topics = vec![
            TopicRequest::with_payload(
                "l2_data",
                json!({"portfolio_id": "pf-1", "product_ids": ["BTC-USD"]}),
            ),
            TopicRequest::with_payload("heartbeats", json!({"portfolio_id": "pf-1"})),
        ];
        let messages = adapter
            .build_operation_messages(&topics, WsKey::PrimeMarketData, WsOperation::Subscribe)
            .unwrap();
        assert_eq!(messages.len(), 2);

        let request = parse(&messages[0]);
        assert_eq!(request["channel"], "l2_data");
        assert_eq!(request["access_key"], "my-key");
        assert_eq!(request["api_key_id"], "svc-1");
        assert_eq!(request["portfolio_id"], "pf-1");
        let products = vec!["BTC-USD".to_string()];
        let expected = prime_ws_signature(
            PrimeSignParams {
                channel: "l2_data",
                api_key: "my-key",
                secret: SECRET,
                svc_account_id: "svc-1",
                portfolio_id: "pf-1",
                product_ids: &products,
            },
            request["timestamp"].as_str().unwrap(),
        )
        .unwrap();
        assert_eq!(request["signature"].as_str().unwrap(), expected);
    }

    #[test]
    fn test_non_object_payload_rejected() {
        let adapter = CoinbaseAdapter::new();
        let topics = vec![TopicRequest::with_payload("ticker", json!(["BTC-USD"]))];
        let result =
            adapter.build_operation_messages(&topics, WsKey::ExchangeMarketData, WsOperation::Subscribe);
        assert!(matches!(result, Err(WsError::Config { .. })));
    }

    #[test]
    fn test_classification() {
        let adapter = CoinbaseAdapter::new();
        let key = WsKey::ExchangeMarketData;
        let kind = |message: &str| {
            adapter
                .resolve_emittable_events(key, message)
                .unwrap()
                .into_iter()
                .map(|e| e.kind)
                .collect::<Vec<_>>()
        };

        assert_eq!(
            kind(r#"{"type":"error","message":"bad"}"#),
            vec![EmittableKind::Exception]
        );
        assert_eq!(kind(r#"{"type":"REJECT"}"#), vec![EmittableKind::Exception]);
        assert_eq!(
            kind(r#"{"type":"subscriptions","channels":[]}"#),
            vec![EmittableKind::Response]
        );
        assert_eq!(
            kind(r#"{"channel":"subscriptions","events":[]}"#),
            vec![EmittableKind::Response]
        );
        assert_eq!(
            kind(r#"{"type":"ticker","price":"1"}"#),
            vec![EmittableKind::Update]
        );
        assert!(kind("[1,2]").is_empty());
        assert!(adapter.resolve_emittable_events(key, "not json").is_err());
    }

    #[test]
    fn test_response_carries_request_id() {
        let adapter = CoinbaseAdapter::new();
        let events = adapter
            .resolve_emittable_events(
                WsKey::ExchangeMarketData,
                r#"{"type":"subscriptions","id":7}"#,
            )
            .unwrap();
        assert_eq!(events[0].request_id, Some(RequestId::new(7)));
    }
}
