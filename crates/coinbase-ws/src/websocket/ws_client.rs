//! User-facing WebSocket client API.
//!
//! The [`WsClient`] is a cheap, cloneable handle to the connection manager.
//! It covers connecting, topic subscriptions, correlated requests and
//! closing, per [`WsKey`].

use std::{sync::Arc, time::Duration};

use serde::Serialize;
use serde_json::Value;
use tokio::{
    runtime::Handle,
    sync::{broadcast, mpsc, oneshot},
    time::Instant,
};
use tracing::info;

use super::{
    actor::{ActorCommand, ConnectionActor, ConnectionSnapshot},
    config::WsClientConfig,
    correlator::next_request_id,
    events::{EventStream, WsEvent},
    protocol::{ExchangeAdapter, WsMessage},
    transport::{Connector, TungsteniteConnector},
    types::{ConnectionState, RequestId, TopicRequest, WsKey},
};
use crate::error::{WsError, WsResult};

/// WebSocket client managing one connection per [`WsKey`].
///
/// Connections open lazily: subscribing to a key that is not connected
/// starts the connection, and desired topics survive reconnects.
///
/// # Example
///
/// ```rust,ignore
/// let client = WsClient::new(WsClientConfig::default(), CoinbaseAdapter::new())?;
/// let mut events = client.events();
///
/// client
///     .subscribe([TopicRequest::with_payload("ticker", json!({"product_ids": ["BTC-USD"]}))],
///         WsKey::ExchangeMarketData)
///     .await?;
///
/// while let Some(event) = events.recv().await {
///     println!("{event:?}");
/// }
/// ```
pub struct WsClient<A: ExchangeAdapter> {
    /// Channel to send commands to the actor.
    cmd_tx: mpsc::Sender<ActorCommand>,
    /// Event bus; kept so new receivers can be created.
    event_tx: broadcast::Sender<WsEvent>,
    adapter: Arc<A>,
    config: Arc<WsClientConfig>,
}

impl<A: ExchangeAdapter> Clone for WsClient<A> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            event_tx: self.event_tx.clone(),
            adapter: Arc::clone(&self.adapter),
            config: Arc::clone(&self.config),
        }
    }
}

impl<A: ExchangeAdapter> WsClient<A> {
    /// Create a client using the default `tokio-tungstenite` transport.
    ///
    /// Must be called from within a Tokio runtime. No socket is opened
    /// until a key is connected or subscribed.
    pub fn new(config: WsClientConfig, adapter: A) -> WsResult<Self> {
        Self::with_connector(config, adapter, TungsteniteConnector)
    }

    /// Create a client with a custom transport.
    pub fn with_connector(
        config: WsClientConfig,
        adapter: A,
        connector: impl Connector,
    ) -> WsResult<Self> {
        config.validate().map_err(WsError::config)?;
        let runtime = Handle::try_current()
            .map_err(|_| WsError::config("WsClient must be created inside a Tokio runtime"))?;

        let config = Arc::new(config);
        let adapter = Arc::new(adapter);
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_channel_capacity);
        let (event_tx, _) = broadcast::channel(config.event_channel_capacity);

        let actor = ConnectionActor::new(
            Arc::clone(&config),
            Arc::clone(&adapter),
            Arc::new(connector),
            cmd_rx,
            event_tx.clone(),
        );
        runtime.spawn(actor.run());

        info!(sandbox = config.use_sandbox, "WebSocket client created");

        Ok(Self {
            cmd_tx,
            event_tx,
            adapter,
            config,
        })
    }

    /// Subscribe to the event bus. Only events emitted after this call are
    /// delivered.
    pub fn events(&self) -> EventStream {
        EventStream::new(self.event_tx.subscribe())
    }

    /// The adapter this client was built with.
    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn config(&self) -> &WsClientConfig {
        &self.config
    }

    /// Returns `true` once the connection manager has stopped.
    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    // ========================================================================
    // Connection API
    // ========================================================================

    /// Connect a key and wait until it is ready for events.
    ///
    /// Concurrent calls share a single connection attempt. Resolves right
    /// away if the key is already connected.
    pub async fn connect(&self, ws_key: WsKey) -> WsResult<WsKey> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(ActorCommand::Connect { ws_key, reply_tx })
            .await?;
        reply_rx.await.map_err(|_| WsError::ClientClosed)?
    }

    /// Connect every key in turn, stopping at the first failure.
    pub async fn connect_all(&self, ws_keys: &[WsKey]) -> WsResult<Vec<WsKey>> {
        let mut connected = Vec::with_capacity(ws_keys.len());
        for ws_key in ws_keys {
            connected.push(self.connect(*ws_key).await?);
        }
        Ok(connected)
    }

    /// Close a key. No reconnect follows and pending requests are rejected.
    ///
    /// A graceful close waits for the peer to answer the close frame;
    /// `force` tears the socket down immediately.
    pub async fn close(&self, ws_key: WsKey, force: bool) -> WsResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(ActorCommand::Close {
            ws_key,
            force,
            reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| WsError::ClientClosed)
    }

    /// Close every key the client knows about.
    pub async fn close_all(&self, force: bool) -> WsResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(ActorCommand::CloseAll { force, reply_tx })
            .await?;
        reply_rx.await.map_err(|_| WsError::ClientClosed)
    }

    // ========================================================================
    // Subscription API
    // ========================================================================

    /// Add topics to a key's desired subscriptions.
    ///
    /// Returns once the topics are recorded. They are sent straight away if
    /// the connection is ready; otherwise the key is connected if needed
    /// and the topics go out when it becomes ready.
    pub async fn subscribe<I, T>(&self, topics: I, ws_key: WsKey) -> WsResult<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<TopicRequest>,
    {
        let topics: Vec<TopicRequest> = topics.into_iter().map(Into::into).collect();
        if topics.is_empty() {
            return Ok(());
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(ActorCommand::Subscribe {
            ws_key,
            topics,
            reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| WsError::ClientClosed)?
    }

    /// Remove topics from a key's desired subscriptions, sending the
    /// unsubscribe if the connection is ready. Never opens a connection.
    pub async fn unsubscribe<I, T>(&self, topics: I, ws_key: WsKey) -> WsResult<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<TopicRequest>,
    {
        let topics: Vec<TopicRequest> = topics.into_iter().map(Into::into).collect();
        if topics.is_empty() {
            return Ok(());
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(ActorCommand::Unsubscribe {
            ws_key,
            topics,
            reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| WsError::ClientClosed)?
    }

    // ========================================================================
    // Request-Response API
    // ========================================================================

    /// Send a correlated request and wait for its response.
    ///
    /// `build` receives the allocated request id and returns the message to
    /// send. The key is connected first if needed. The configured request
    /// timeout covers both the connect and the response; running out while
    /// still connecting yields [`WsError::Timeout`].
    pub async fn request<F>(&self, ws_key: WsKey, build: F) -> WsResult<Value>
    where
        F: FnOnce(RequestId) -> WsResult<WsMessage>,
    {
        self.request_with_timeout(ws_key, build, self.config.request_timeout)
            .await
    }

    /// Like [`request`](Self::request) with an explicit timeout.
    pub async fn request_with_timeout<F>(
        &self,
        ws_key: WsKey,
        build: F,
        timeout: Duration,
    ) -> WsResult<Value>
    where
        F: FnOnce(RequestId) -> WsResult<WsMessage>,
    {
        let started = Instant::now();
        tokio::time::timeout(timeout, self.connect(ws_key))
            .await
            .map_err(|_| WsError::timeout(timeout))??;
        let remaining = timeout.saturating_sub(started.elapsed());

        let request_id = next_request_id();
        let message = build(request_id)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(ActorCommand::Request {
            ws_key,
            request_id,
            message,
            timeout: remaining,
            reply_tx,
        })
        .await?;

        match tokio::time::timeout(remaining, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(WsError::ClientClosed),
            Err(_) => Err(WsError::request_timeout(timeout, request_id)),
        }
    }

    /// Serialize `payload`, let the adapter attach the request id, and wait
    /// for the response.
    pub async fn request_json<R: Serialize>(&self, ws_key: WsKey, payload: &R) -> WsResult<Value> {
        let payload = serde_json::to_value(payload)?;
        let adapter = Arc::clone(&self.adapter);
        self.request(ws_key, move |request_id| {
            adapter.inject_request_id(payload, request_id)
        })
        .await
    }

    // ========================================================================
    // Low-Level API
    // ========================================================================

    /// Send a message on an open connection without expecting a response.
    pub async fn send(&self, ws_key: WsKey, message: WsMessage) -> WsResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(ActorCommand::Send {
            ws_key,
            message,
            reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| WsError::ClientClosed)?
    }

    /// Send a JSON payload on an open connection.
    pub async fn send_json<T: Serialize>(&self, ws_key: WsKey, payload: &T) -> WsResult<()> {
        let json = serde_json::to_string(payload)?;
        self.send(ws_key, WsMessage::text(json)).await
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Point-in-time view of a key's connection record.
    pub async fn snapshot(&self, ws_key: WsKey) -> WsResult<ConnectionSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(ActorCommand::Snapshot { ws_key, reply_tx })
            .await?;
        reply_rx.await.map_err(|_| WsError::ClientClosed)
    }

    /// Current state of a key, `None` if it was never used.
    pub async fn connection_state(&self, ws_key: WsKey) -> WsResult<Option<ConnectionState>> {
        Ok(self.snapshot(ws_key).await?.state)
    }

    /// Whether the key has an open socket in the `Connected` state.
    pub async fn is_connected(&self, ws_key: WsKey) -> WsResult<bool> {
        Ok(self.snapshot(ws_key).await?.is_open)
    }

    /// A key's desired subscriptions, in registration order.
    pub async fn subscribed_topics(&self, ws_key: WsKey) -> WsResult<Vec<TopicRequest>> {
        Ok(self.snapshot(ws_key).await?.topics)
    }

    /// Requests on the key still awaiting a response.
    pub async fn pending_count(&self, ws_key: WsKey) -> WsResult<usize> {
        Ok(self.snapshot(ws_key).await?.pending_requests)
    }

    async fn send_command(&self, cmd: ActorCommand) -> WsResult<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| WsError::ClientClosed)
    }
}
