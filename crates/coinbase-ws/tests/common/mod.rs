//! Shared fixtures: an in-memory transport and a small JSON adapter.

#![allow(dead_code)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use coinbase_ws::{
    error::{WsError, WsResult},
    websocket::{
        Connector, EmittableEvent, EmittableKind, EventStream, ExchangeAdapter, RequestId,
        TopicRequest, WsClientConfig, WsEvent, WsKey, WsMessage, WsOperation, WsSink, WsStream,
    },
};
use futures::{SinkExt, StreamExt, channel::mpsc as fmpsc};
use serde_json::{Value, json};
use tokio::{sync::mpsc, time::timeout};
use tokio_tungstenite::tungstenite::Message;

pub const WAIT: Duration = Duration::from_secs(2);

/// Server side of one in-memory socket.
pub struct ServerConn {
    pub url: String,
    from_client: fmpsc::UnboundedReceiver<Message>,
    to_client: Option<fmpsc::UnboundedSender<WsResult<Message>>>,
}

impl ServerConn {
    /// Next frame from the client, protocol pings included.
    pub async fn recv_frame(&mut self) -> Option<Message> {
        timeout(WAIT, self.from_client.next()).await.ok().flatten()
    }

    /// Next text frame parsed as JSON, skipping pings.
    pub async fn recv_json(&mut self) -> Value {
        loop {
            match self.recv_frame().await {
                Some(Message::Text(text)) => {
                    return serde_json::from_str(&text).expect("client sent invalid JSON");
                }
                Some(Message::Ping(_)) => continue,
                other => panic!("expected a text frame, got {other:?}"),
            }
        }
    }

    /// Assert that no text frame arrives within `window`.
    pub async fn expect_silence(&mut self, window: Duration) {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            match tokio::time::timeout_at(deadline, self.from_client.next()).await {
                Err(_) => return,
                Ok(Some(Message::Ping(_))) => continue,
                Ok(None) => return,
                Ok(Some(frame)) => panic!("unexpected frame: {frame:?}"),
            }
        }
    }

    pub fn send_json(&self, value: Value) {
        self.send_frame(Message::Text(value.to_string()));
    }

    pub fn send_frame(&self, frame: Message) {
        if let Some(tx) = &self.to_client {
            let _ = tx.unbounded_send(Ok(frame));
        }
    }

    /// Drop the server side; the client sees the stream end.
    pub fn hang_up(&mut self) {
        self.to_client = None;
    }
}

/// Connector handing every opened socket to the test through a channel.
pub struct MockConnector {
    pub connects: Arc<AtomicUsize>,
    failures: Arc<AtomicUsize>,
    delay: Duration,
    conns: mpsc::UnboundedSender<ServerConn>,
}

impl MockConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerConn>) {
        let (conns, rx) = mpsc::unbounded_channel();
        (
            Self {
                connects: Arc::new(AtomicUsize::new(0)),
                failures: Arc::new(AtomicUsize::new(0)),
                delay: Duration::ZERO,
                conns,
            },
            rx,
        )
    }

    /// Delay every connect, so concurrent callers overlap.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the next `count` connects with an HTTP 503 handshake error.
    pub fn failing(self, count: usize) -> Self {
        self.failures.store(count, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> WsResult<(WsSink, WsStream)> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(WsError::Handshake { status: 503 });
        }

        let (client_tx, from_client) = fmpsc::unbounded::<Message>();
        let (to_client, client_rx) = fmpsc::unbounded::<WsResult<Message>>();
        let sink: WsSink = Box::pin(client_tx.sink_map_err(|e| WsError::websocket(e.to_string())));
        let stream: WsStream = Box::pin(client_rx);

        let _ = self.conns.send(ServerConn {
            url: url.to_string(),
            from_client,
            to_client: Some(to_client),
        });
        Ok((sink, stream))
    }
}

/// Minimal JSON protocol:
/// - outbound `{"op": "subscribe", "topics": [...]}` and `{"op": "auth"}`
/// - inbound `{"event": "auth" | "subscribed" | "error" | "ready" | ...}`,
///   with an optional `id` echoing a request
pub struct TestAdapter;

impl ExchangeAdapter for TestAdapter {
    fn ws_url(&self, ws_key: WsKey, config: &WsClientConfig) -> WsResult<String> {
        Ok(config
            .ws_url
            .clone()
            .unwrap_or_else(|| format!("ws://mock/{ws_key}")))
    }

    fn is_private_ws_key(&self, ws_key: WsKey) -> bool {
        ws_key == WsKey::AdvTradeUserData
    }

    fn build_operation_messages(
        &self,
        topics: &[TopicRequest],
        _ws_key: WsKey,
        operation: WsOperation,
    ) -> WsResult<Vec<WsMessage>> {
        let names: Vec<&str> = topics.iter().map(|t| t.topic.as_str()).collect();
        Ok(vec![WsMessage::json(
            &json!({"op": operation.as_str(), "topics": names}),
        )?])
    }

    fn build_auth_request(&self, _ws_key: WsKey) -> WsResult<Option<WsMessage>> {
        Ok(Some(WsMessage::json(&json!({"op": "auth"}))?))
    }

    fn resolve_emittable_events(
        &self,
        _ws_key: WsKey,
        message: &str,
    ) -> WsResult<Vec<EmittableEvent>> {
        let event: Value = serde_json::from_str(message)?;
        let kind = match event.get("event").and_then(Value::as_str) {
            Some("auth") => EmittableKind::Authenticated,
            Some("subscribed") | Some("result") => EmittableKind::Response,
            Some("error") => EmittableKind::Exception,
            Some("ready") => EmittableKind::ConnectionReady,
            Some("update") => EmittableKind::Update,
            Some(other) => EmittableKind::Custom(other.to_string()),
            None => return Ok(Vec::new()),
        };
        let emittable = EmittableEvent::new(kind, event.clone());
        Ok(vec![match event.get("id").and_then(RequestId::from_value) {
            Some(id) => emittable.with_request_id(id),
            None => emittable,
        }])
    }
}

/// Short timers so lifecycle tests run quickly.
pub fn fast_config() -> WsClientConfig {
    WsClientConfig::default()
        .ping_interval(Duration::from_secs(30))
        .reconnect_timeout(Duration::from_millis(50))
        .connect_timeout(Duration::from_secs(1))
}

pub async fn next_event(events: &mut EventStream) -> WsEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event bus closed")
}

/// Skip events until one matches.
pub async fn wait_for(events: &mut EventStream, mut matches: impl FnMut(&WsEvent) -> bool) -> WsEvent {
    loop {
        let event = next_event(events).await;
        if matches(&event) {
            return event;
        }
    }
}

pub async fn next_conn(conns: &mut mpsc::UnboundedReceiver<ServerConn>) -> ServerConn {
    timeout(WAIT, conns.recv())
        .await
        .expect("timed out waiting for a connection")
        .expect("connector dropped")
}

/// Allow in-flight actor work to settle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
