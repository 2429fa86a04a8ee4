//! Connection actor for WebSocket lifecycle management.
//!
//! A single background task owns every connection record and handles, one at
//! a time:
//! - Commands from the client API
//! - Socket events from per-connection reader tasks
//! - Connect results and timer firings (ping, pong timeout, reconnect delay)
//!
//! Handlers never await, so a record is never observed half-updated.
//! Subscription bookkeeping lives in `coordinator.rs` and request
//! correlation in `correlator.rs`; both extend [`ConnectionActor`].

use std::{fmt, sync::Arc, time::Duration};

use serde_json::Value;
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    time::{Instant, MissedTickBehavior, interval, interval_at, sleep, timeout},
};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};

use super::{
    config::WsClientConfig,
    events::WsEvent,
    pending::Responder,
    protocol::{ExchangeAdapter, WsMessage},
    store::{Timer, WsStore},
    transport::{ConnectionEpoch, Connector, SocketHandle, WsSink, WsStream},
    types::{
        ConnectionState, EmittableEvent, EmittableKind, RequestId, TopicRequest, WsKey, WsOperation,
    },
};
use crate::error::{WsError, WsResult};

// ============================================================================
// Command Types
// ============================================================================

/// Commands sent from the client API to the connection actor.
pub(crate) enum ActorCommand {
    /// Open the key's socket, or wait for the attempt already underway.
    Connect {
        ws_key: WsKey,
        reply_tx: oneshot::Sender<WsResult<WsKey>>,
    },
    Subscribe {
        ws_key: WsKey,
        topics: Vec<TopicRequest>,
        reply_tx: oneshot::Sender<WsResult<()>>,
    },
    Unsubscribe {
        ws_key: WsKey,
        topics: Vec<TopicRequest>,
        reply_tx: oneshot::Sender<WsResult<()>>,
    },
    /// Send a message without expecting a response.
    Send {
        ws_key: WsKey,
        message: WsMessage,
        reply_tx: oneshot::Sender<WsResult<()>>,
    },
    /// Send a correlated request.
    Request {
        ws_key: WsKey,
        request_id: RequestId,
        message: WsMessage,
        timeout: Duration,
        reply_tx: Responder,
    },
    Close {
        ws_key: WsKey,
        force: bool,
        reply_tx: oneshot::Sender<()>,
    },
    CloseAll {
        force: bool,
        reply_tx: oneshot::Sender<()>,
    },
    Snapshot {
        ws_key: WsKey,
        reply_tx: oneshot::Sender<ConnectionSnapshot>,
    },
}

/// Point-in-time view of one key's record.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnectionSnapshot {
    /// `None` if the key was never used.
    pub state: Option<ConnectionState>,
    pub is_open: bool,
    pub is_authenticated: bool,
    pub topics: Vec<TopicRequest>,
    pub pending_requests: usize,
}

// ============================================================================
// Internal Events
// ============================================================================

/// Both halves of a freshly opened socket.
pub(crate) struct OpenedSocket {
    pub(crate) sink: WsSink,
    pub(crate) stream: WsStream,
}

impl fmt::Debug for OpenedSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OpenedSocket")
    }
}

/// Events produced by tasks the actor spawned.
#[derive(Debug)]
pub(crate) enum InternalEvent {
    Opened {
        ws_key: WsKey,
        epoch: ConnectionEpoch,
        socket: OpenedSocket,
    },
    ConnectFailed {
        ws_key: WsKey,
        epoch: ConnectionEpoch,
        error: WsError,
    },
    SocketMessage {
        ws_key: WsKey,
        epoch: ConnectionEpoch,
        message: Message,
    },
    SocketError {
        ws_key: WsKey,
        epoch: ConnectionEpoch,
        error: WsError,
    },
    SocketClosed {
        ws_key: WsKey,
        epoch: ConnectionEpoch,
        reason: Option<String>,
    },
    PingDue {
        ws_key: WsKey,
        timer_id: u64,
    },
    PongTimeout {
        ws_key: WsKey,
        timer_id: u64,
    },
    ReconnectDue {
        ws_key: WsKey,
        timer_id: u64,
    },
    CloseTimeout {
        ws_key: WsKey,
        timer_id: u64,
    },
}

// ============================================================================
// Connection Actor
// ============================================================================

/// Owns every connection record and drives its state machine.
pub(crate) struct ConnectionActor<A: ExchangeAdapter> {
    pub(crate) config: Arc<WsClientConfig>,
    pub(crate) adapter: Arc<A>,
    connector: Arc<dyn Connector>,
    pub(crate) store: WsStore,
    cmd_rx: mpsc::Receiver<ActorCommand>,
    internal_tx: mpsc::UnboundedSender<InternalEvent>,
    internal_rx: mpsc::UnboundedReceiver<InternalEvent>,
    event_tx: broadcast::Sender<WsEvent>,
    next_timer_id: u64,
}

impl<A: ExchangeAdapter> ConnectionActor<A> {
    pub(crate) fn new(
        config: Arc<WsClientConfig>,
        adapter: Arc<A>,
        connector: Arc<dyn Connector>,
        cmd_rx: mpsc::Receiver<ActorCommand>,
        event_tx: broadcast::Sender<WsEvent>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        Self {
            store: WsStore::new(config.max_pending_requests),
            config,
            adapter,
            connector,
            cmd_rx,
            internal_tx,
            internal_rx,
            event_tx,
            next_timer_id: 0,
        }
    }

    /// Run until every client handle is dropped.
    pub(crate) async fn run(mut self) {
        info!("Starting WebSocket connection manager");
        let mut cleanup = interval(self.config.pending_cleanup_interval);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                Some(event) = self.internal_rx.recv() => self.handle_internal_event(event),
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        info!("All client handles dropped; shutting down");
                        break;
                    }
                },
                _ = cleanup.tick() => self.cleanup_stale_requests(),
            }
        }

        self.shutdown();
        info!("WebSocket connection manager stopped");
    }

    fn handle_command(&mut self, cmd: ActorCommand) {
        match cmd {
            ActorCommand::Connect { ws_key, reply_tx } => self.connect(ws_key, Some(reply_tx)),
            ActorCommand::Subscribe {
                ws_key,
                topics,
                reply_tx,
            } => {
                let _ = reply_tx.send(self.subscribe_topics(ws_key, topics));
            }
            ActorCommand::Unsubscribe {
                ws_key,
                topics,
                reply_tx,
            } => {
                let _ = reply_tx.send(self.unsubscribe_topics(ws_key, topics));
            }
            ActorCommand::Send {
                ws_key,
                message,
                reply_tx,
            } => {
                let result = match self.store.socket(ws_key) {
                    Some(socket) if self.store.is_ws_open(ws_key) => socket.send(&message),
                    _ => Err(WsError::NotConnected { ws_key }),
                };
                let _ = reply_tx.send(result);
            }
            ActorCommand::Request {
                ws_key,
                request_id,
                message,
                timeout,
                reply_tx,
            } => self.send_request(ws_key, request_id, message, timeout, reply_tx),
            ActorCommand::Close {
                ws_key,
                force,
                reply_tx,
            } => {
                self.close(ws_key, force);
                let _ = reply_tx.send(());
            }
            ActorCommand::CloseAll { force, reply_tx } => {
                for ws_key in self.store.keys() {
                    self.close(ws_key, force);
                }
                let _ = reply_tx.send(());
            }
            ActorCommand::Snapshot { ws_key, reply_tx } => {
                let snapshot = self
                    .store
                    .get(ws_key)
                    .map(|record| ConnectionSnapshot {
                        state: Some(record.state()),
                        is_open: self.store.is_ws_open(ws_key),
                        is_authenticated: record.is_authenticated(),
                        topics: record.topics().to_vec(),
                        pending_requests: record.pending_count(),
                    })
                    .unwrap_or_default();
                let _ = reply_tx.send(snapshot);
            }
        }
    }

    fn handle_internal_event(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::Opened {
                ws_key,
                epoch,
                socket,
            } => self.on_open(ws_key, epoch, socket),
            InternalEvent::ConnectFailed {
                ws_key,
                epoch,
                error,
            } => self.on_connect_failed(ws_key, epoch, error),
            InternalEvent::SocketMessage {
                ws_key,
                epoch,
                message,
            } => {
                if self.is_current_socket(ws_key, epoch) {
                    self.on_message(ws_key, message);
                }
            }
            InternalEvent::SocketError {
                ws_key,
                epoch,
                error,
            } => {
                if self.is_current_socket(ws_key, epoch) {
                    self.handle_ws_error(ws_key, "Websocket error", &error);
                }
            }
            InternalEvent::SocketClosed {
                ws_key,
                epoch,
                reason,
            } => {
                if self.is_current_socket(ws_key, epoch) {
                    self.handle_close(ws_key, reason);
                }
            }
            InternalEvent::PingDue { ws_key, timer_id } => {
                let current = self
                    .store
                    .get(ws_key)
                    .and_then(|c| c.timers.ping.as_ref())
                    .is_some_and(|t| t.id == timer_id);
                if current && self.store.is_ws_open(ws_key) {
                    self.ping(ws_key);
                }
            }
            InternalEvent::PongTimeout { ws_key, timer_id } => {
                let Some(record) = self.store.get_mut(ws_key) else {
                    return;
                };
                if record.timers.pong.as_ref().is_some_and(|t| t.id == timer_id) {
                    record.timers.pong = None;
                    info!(ws_key = %ws_key, "Pong timeout - closing socket to reconnect");
                    self.handle_close(ws_key, Some("pong timeout".to_string()));
                }
            }
            InternalEvent::ReconnectDue { ws_key, timer_id } => {
                let Some(record) = self.store.get_mut(ws_key) else {
                    return;
                };
                if record
                    .timers
                    .reconnect
                    .as_ref()
                    .is_some_and(|t| t.id == timer_id)
                {
                    record.timers.reconnect = None;
                    if record.state.is_reconnecting() {
                        info!(ws_key = %ws_key, "Reconnecting to websocket");
                        self.open_connection(ws_key);
                    }
                }
            }
            InternalEvent::CloseTimeout { ws_key, timer_id } => {
                let Some(record) = self.store.get_mut(ws_key) else {
                    return;
                };
                if record.timers.close.as_ref().is_some_and(|t| t.id == timer_id)
                    && record.state == ConnectionState::Closing
                {
                    record.timers.close = None;
                    warn!(ws_key = %ws_key, "Peer did not finish the close handshake; terminating");
                    self.handle_close(ws_key, Some("close timeout".to_string()));
                }
            }
        }
    }

    // ========================================================================
    // Connecting
    // ========================================================================

    /// Open a socket unless one is open or an attempt is underway. The
    /// responder, if any, settles once the connection is ready for events.
    pub(crate) fn connect(
        &mut self,
        ws_key: WsKey,
        responder: Option<oneshot::Sender<WsResult<WsKey>>>,
    ) {
        let record = self.store.get_or_create(ws_key);

        if record.state == ConnectionState::Closing {
            warn!(ws_key = %ws_key, "Refused to connect while the connection is closing");
            if let Some(tx) = responder {
                let _ = tx.send(Err(WsError::Disconnected { ws_key }));
            }
            return;
        }

        let awaiting_ready = record.in_progress.is_some();
        if !awaiting_ready && self.store.is_ws_open(ws_key) {
            debug!(ws_key = %ws_key, "Refused to open a second socket, connection is active");
            if let Some(tx) = responder {
                let _ = tx.send(Ok(ws_key));
            }
            return;
        }

        let in_progress = awaiting_ready || self.store.is_connection_attempt_in_progress(ws_key);
        let deferred = self.store.create_in_progress_promise(ws_key);
        if let Some(tx) = responder {
            deferred.attach(tx);
        }

        if in_progress {
            debug!(ws_key = %ws_key, "Connection attempt already in progress, waiting");
            return;
        }

        self.open_connection(ws_key);
    }

    /// Start a connect task for the key, bypassing the guards in
    /// [`connect`](Self::connect).
    fn open_connection(&mut self, ws_key: WsKey) {
        let url = match self.adapter.ws_url(ws_key, &self.config) {
            Ok(url) => url,
            Err(e) => {
                error!(ws_key = %ws_key, error = %e, "Failed to resolve websocket URL");
                let message = e.to_string();
                if let Some(record) = self.store.get_mut(ws_key) {
                    record.state = ConnectionState::Initial;
                    record.reconnect_pending = false;
                }
                if let Some(deferred) = self.store.clear_in_progress_promise(ws_key) {
                    deferred.reject(|| WsError::config(message.clone()));
                }
                self.emit(WsEvent::Exception {
                    ws_key,
                    message: e.to_string(),
                    event: None,
                });
                return;
            }
        };

        self.store.create_in_progress_promise(ws_key);
        let record = self.store.get_or_create(ws_key);
        record.state = ConnectionState::Connecting;
        record.epoch = record.epoch.next();
        let epoch = record.epoch;

        info!(ws_key = %ws_key, url = %url, "Opening websocket connection");

        let connector = Arc::clone(&self.connector);
        let events = self.internal_tx.clone();
        let connect_timeout = self.config.connect_timeout;
        let task = tokio::spawn(async move {
            let result = match timeout(connect_timeout, connector.connect(&url)).await {
                Ok(result) => result,
                Err(_) => Err(WsError::timeout(connect_timeout)),
            };
            let event = match result {
                Ok((sink, stream)) => InternalEvent::Opened {
                    ws_key,
                    epoch,
                    socket: OpenedSocket { sink, stream },
                },
                Err(error) => InternalEvent::ConnectFailed {
                    ws_key,
                    epoch,
                    error,
                },
            };
            let _ = events.send(event);
        });

        if let Some(previous) = record.connect_task.replace(task.abort_handle()) {
            previous.abort();
        }
    }

    fn on_open(&mut self, ws_key: WsKey, epoch: ConnectionEpoch, opened: OpenedSocket) {
        let Some(record) = self.store.get_mut(ws_key) else {
            return;
        };
        if record.epoch != epoch || record.state != ConnectionState::Connecting {
            debug!(ws_key = %ws_key, "Dropping socket from an abandoned connection attempt");
            return;
        }

        record.connect_task = None;
        record.socket = Some(SocketHandle::spawn(
            ws_key,
            epoch,
            opened.sink,
            opened.stream,
            self.internal_tx.clone(),
        ));
        record.state = ConnectionState::Connected;
        let reconnected = std::mem::take(&mut record.reconnect_pending);

        if reconnected {
            info!(ws_key = %ws_key, "Websocket reconnected");
            self.emit(WsEvent::Reconnected { ws_key });
        } else {
            info!(ws_key = %ws_key, "Websocket connected");
            self.emit(WsEvent::Open { ws_key });
        }

        self.start_ping_timer(ws_key);

        if !self.config.require_connection_ready_confirmation {
            self.on_ready_for_events(ws_key);
        }
    }

    fn on_connect_failed(&mut self, ws_key: WsKey, epoch: ConnectionEpoch, error: WsError) {
        let Some(record) = self.store.get_mut(ws_key) else {
            return;
        };
        if record.epoch != epoch || record.state != ConnectionState::Connecting {
            return;
        }
        record.connect_task = None;

        self.handle_ws_error(ws_key, "Connection failed", &error);
        self.handle_close(ws_key, Some(error.to_string()));
    }

    /// The connection can carry traffic: settle waiters, authenticate if the
    /// key requires it, and replay the desired topics.
    fn on_ready_for_events(&mut self, ws_key: WsKey) {
        if let Some(deferred) = self.store.clear_in_progress_promise(ws_key) {
            deferred.resolve(ws_key);
        }

        let auth_on_connect = self.requires_auth_handshake(ws_key);
        if auth_on_connect {
            self.send_auth_request(ws_key);
        }

        let adapter = Arc::clone(&self.adapter);
        let (public, private) = match self.store.get(ws_key) {
            Some(record) => record
                .topics()
                .partition(|topic| adapter.is_private_topic_request(topic, ws_key)),
            None => return,
        };

        if !public.is_empty() {
            debug!(ws_key = %ws_key, count = public.len(), "Subscribing to public topics");
            self.send_topic_operation(ws_key, &public, WsOperation::Subscribe);
        }

        if private.is_empty() {
            return;
        }
        if auth_on_connect {
            debug!(
                ws_key = %ws_key,
                count = private.len(),
                "Holding private topics until authenticated"
            );
        } else {
            debug!(ws_key = %ws_key, count = private.len(), "Subscribing to private topics");
            self.send_topic_operation(ws_key, &private, WsOperation::Subscribe);
        }
    }

    fn send_auth_request(&mut self, ws_key: WsKey) {
        match self.adapter.build_auth_request(ws_key) {
            Ok(Some(request)) => {
                info!(ws_key = %ws_key, "Sending auth request");
                self.send_or_log(ws_key, &request, "auth request");
            }
            Ok(None) => {
                warn!(ws_key = %ws_key, "No auth request available for private connection");
            }
            Err(e) => {
                error!(ws_key = %ws_key, error = %e, "Failed to build auth request");
                self.emit(WsEvent::Exception {
                    ws_key,
                    message: e.to_string(),
                    event: None,
                });
            }
        }
    }

    fn on_authenticated(&mut self, ws_key: WsKey) {
        let Some(record) = self.store.get_mut(ws_key) else {
            return;
        };
        record.is_authenticated = true;

        if !self.requires_auth_handshake(ws_key) {
            return;
        }

        let adapter = Arc::clone(&self.adapter);
        let private: Vec<TopicRequest> = self
            .store
            .topics(ws_key)
            .into_iter()
            .filter(|topic| adapter.is_private_topic_request(topic, ws_key))
            .collect();
        if !private.is_empty() {
            debug!(ws_key = %ws_key, count = private.len(), "Subscribing to private topics");
            self.send_topic_operation(ws_key, &private, WsOperation::Subscribe);
        }
    }

    /// Keys that authenticate once per connection before private topics flow.
    pub(crate) fn requires_auth_handshake(&self, ws_key: WsKey) -> bool {
        self.config.auth_private_connections_on_connect && self.adapter.is_private_ws_key(ws_key)
    }

    // ========================================================================
    // Inbound Messages
    // ========================================================================

    fn on_message(&mut self, ws_key: WsKey, message: Message) {
        // Any inbound frame proves the connection is alive.
        if let Some(record) = self.store.get_mut(ws_key)
            && record.timers.clear_pong()
        {
            trace!(ws_key = %ws_key, "Cleared pong timer");
        }

        let text = match message {
            Message::Text(text) => text,
            Message::Binary(data) => match self.adapter.decode_binary(&data) {
                Ok(text) => text,
                Err(e) => {
                    warn!(ws_key = %ws_key, error = %e, "Failed to decode binary message");
                    self.emit(WsEvent::Exception {
                        ws_key,
                        message: e.to_string(),
                        event: None,
                    });
                    return;
                }
            },
            Message::Ping(_) => {
                trace!(ws_key = %ws_key, "Received ping frame");
                return;
            }
            Message::Pong(_) => {
                trace!(ws_key = %ws_key, "Received pong frame");
                return;
            }
            Message::Close(_) | Message::Frame(_) => return,
        };

        self.on_text_message(ws_key, &text);
    }

    fn on_text_message(&mut self, ws_key: WsKey, text: &str) {
        if self.adapter.is_ws_pong(text) {
            trace!(ws_key = %ws_key, "Received pong");
            return;
        }

        if self.adapter.is_ws_ping(text) {
            trace!(ws_key = %ws_key, "Received ping, sending pong");
            if let Some(pong) = self.adapter.build_pong(ws_key, text) {
                self.send_or_log(ws_key, &pong, "pong");
            }
            return;
        }

        if self.adapter.should_reconnect(text) {
            info!(ws_key = %ws_key, "Server asked for a reconnect");
            self.handle_close(ws_key, Some("server requested reconnect".to_string()));
            return;
        }

        let events = match self.adapter.resolve_emittable_events(ws_key, text) {
            Ok(events) => events,
            Err(e) => {
                error!(ws_key = %ws_key, error = %e, "Failed to parse websocket message");
                self.emit(WsEvent::Exception {
                    ws_key,
                    message: e.to_string(),
                    event: Some(Value::String(text.to_string())),
                });
                return;
            }
        };

        if events.is_empty() {
            error!(ws_key = %ws_key, message = text, "Unhandled websocket message");
            let event =
                serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()));
            self.emit(WsEvent::Update { ws_key, event });
            return;
        }

        for event in events {
            self.dispatch_event(ws_key, event);
        }
    }

    fn dispatch_event(&mut self, ws_key: WsKey, emittable: EmittableEvent) {
        let EmittableEvent {
            kind,
            event,
            request_id,
        } = emittable;

        if let Some(request_id) = request_id {
            self.resolve_request(ws_key, request_id, &kind, &event);
        }

        match kind {
            EmittableKind::Pong => trace!(ws_key = %ws_key, "Received pong"),
            EmittableKind::ConnectionReady => {
                trace!(ws_key = %ws_key, "Connection ready confirmed");
                if self.adapter.is_private_ws_key(ws_key)
                    && !self.requires_auth_handshake(ws_key)
                    && let Some(record) = self.store.get_mut(ws_key)
                {
                    record.is_authenticated = true;
                }
                self.emit(WsEvent::Response { ws_key, event });
                if self.config.require_connection_ready_confirmation {
                    self.on_ready_for_events(ws_key);
                }
            }
            EmittableKind::Authenticated => {
                info!(ws_key = %ws_key, "Successfully authenticated");
                self.emit(WsEvent::Authenticated { ws_key, event });
                self.on_authenticated(ws_key);
            }
            EmittableKind::Response => self.emit(WsEvent::Response { ws_key, event }),
            EmittableKind::Update => self.emit(WsEvent::Update { ws_key, event }),
            EmittableKind::Exception => {
                let message = event
                    .get("message")
                    .and_then(Value::as_str)
                    .map_or_else(|| event.to_string(), str::to_owned);
                warn!(ws_key = %ws_key, message = %message, "Exchange reported an error");
                self.emit(WsEvent::Exception {
                    ws_key,
                    message,
                    event: Some(event),
                });
            }
            EmittableKind::Custom(event_type) => self.emit(WsEvent::Message {
                ws_key,
                event_type,
                event,
            }),
        }
    }

    // ========================================================================
    // Heartbeat
    // ========================================================================

    fn start_ping_timer(&mut self, ws_key: WsKey) {
        let timer_id = self.next_timer_id();
        let period = self.config.ping_interval;
        let events = self.internal_tx.clone();
        let task = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            loop {
                ticks.tick().await;
                if events
                    .send(InternalEvent::PingDue { ws_key, timer_id })
                    .is_err()
                {
                    break;
                }
            }
        });

        if let Some(record) = self.store.get_mut(ws_key)
            && let Some(previous) = record
                .timers
                .ping
                .replace(Timer::new(timer_id, task.abort_handle()))
        {
            previous.cancel();
        }
    }

    /// Send one heartbeat. A no-op while the previous ping is unanswered.
    pub(crate) fn ping(&mut self, ws_key: WsKey) {
        let Some(record) = self.store.get(ws_key) else {
            return;
        };
        if record.timers.pong.is_some() {
            trace!(ws_key = %ws_key, "Pong timer still active, skipping ping");
            return;
        }
        let Some(socket) = record.socket.as_ref() else {
            error!(ws_key = %ws_key, "Unable to ping, no active socket");
            return;
        };

        let sent = match self.adapter.build_ping(ws_key) {
            Some(message) => socket.send(&message),
            None if self.config.use_websocket_ping => socket.ping(),
            None => return,
        };
        if let Err(e) = sent {
            warn!(ws_key = %ws_key, error = %e, "Failed to send ping");
            return;
        }
        trace!(ws_key = %ws_key, "Sent ping");

        let timer = self.spawn_timer(self.config.pong_timeout, |timer_id| {
            InternalEvent::PongTimeout { ws_key, timer_id }
        });
        if let Some(record) = self.store.get_mut(ws_key) {
            record.timers.pong = Some(timer);
        }
    }

    // ========================================================================
    // Errors, Close and Reconnect
    // ========================================================================

    fn handle_ws_error(&mut self, ws_key: WsKey, context: &str, error: &WsError) {
        if error.is_unauthorized() {
            error!(ws_key = %ws_key, "{context} due to 401 authorization failure");
        } else {
            error!(ws_key = %ws_key, error = %error, "{context}");
        }

        if self.store.is_connection_attempt_in_progress(ws_key) {
            self.store
                .set_connection_state(ws_key, ConnectionState::ErrorReconnecting);
        }

        self.emit(WsEvent::Exception {
            ws_key,
            message: error.to_string(),
            event: None,
        });
    }

    /// Run the close path for a key. Whatever socket or attempt remains is
    /// torn down first.
    fn handle_close(&mut self, ws_key: WsKey, reason: Option<String>) {
        let Some(record) = self.store.get_mut(ws_key) else {
            return;
        };
        record.timers.clear_all();
        if let Some(task) = record.connect_task.take() {
            task.abort();
        }
        if let Some(socket) = record.socket.take() {
            socket.terminate();
        }
        record.is_authenticated = false;

        if record.state == ConnectionState::Closing {
            self.finish_close(ws_key);
            return;
        }

        let was_error = record.state == ConnectionState::ErrorReconnecting;
        let rejected = record
            .pending
            .reject_all(|| WsError::ConnectionLost { ws_key });
        record.state = ConnectionState::Initial;
        warn!(
            ws_key = %ws_key,
            reason = reason.as_deref().unwrap_or("unknown"),
            rejected,
            "Websocket connection closed, reconnecting"
        );

        self.reconnect_with_delay(ws_key, was_error);
        self.emit(WsEvent::Reconnect { ws_key });
    }

    fn finish_close(&mut self, ws_key: WsKey) {
        let Some(record) = self.store.get_mut(ws_key) else {
            return;
        };
        let rejected = record
            .pending
            .reject_all(|| WsError::Disconnected { ws_key });
        record.state = ConnectionState::Initial;
        record.reconnect_pending = false;
        if let Some(deferred) = record.in_progress.take() {
            deferred.reject(|| WsError::Disconnected { ws_key });
        }

        info!(ws_key = %ws_key, rejected, "Websocket connection closed");
        self.emit(WsEvent::Close { ws_key });
    }

    fn reconnect_with_delay(&mut self, ws_key: WsKey, after_error: bool) {
        let delay = self.config.reconnect_timeout;
        let timer = self.spawn_timer(delay, |timer_id| InternalEvent::ReconnectDue {
            ws_key,
            timer_id,
        });

        let Some(record) = self.store.get_mut(ws_key) else {
            timer.cancel();
            return;
        };
        record.timers.clear_all();
        record.timers.reconnect = Some(timer);
        record.reconnect_pending = true;
        record.state = if after_error {
            ConnectionState::ErrorReconnecting
        } else {
            ConnectionState::Reconnecting
        };
        debug!(ws_key = %ws_key, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
    }

    /// Deliberately close a key. No reconnect follows.
    pub(crate) fn close(&mut self, ws_key: WsKey, force: bool) {
        let Some(record) = self.store.get_mut(ws_key) else {
            debug!(ws_key = %ws_key, "Close requested for unknown connection");
            return;
        };
        if record.state == ConnectionState::Initial
            && record.socket.is_none()
            && record.in_progress.is_none()
        {
            debug!(ws_key = %ws_key, "Close requested but no connection is active");
            return;
        }

        info!(ws_key = %ws_key, force, "Closing connection");
        record.state = ConnectionState::Closing;
        record.timers.clear_all();
        if let Some(task) = record.connect_task.take() {
            task.abort();
        }

        let graceful = match record.socket.as_ref() {
            Some(socket) if !force => socket.close().is_ok(),
            _ => false,
        };
        if !graceful {
            self.handle_close(ws_key, None);
            return;
        }

        // Bound how long the peer may take to answer the close frame.
        let timer = self.spawn_timer(self.config.connect_timeout, |timer_id| {
            InternalEvent::CloseTimeout { ws_key, timer_id }
        });
        if let Some(record) = self.store.get_mut(ws_key) {
            record.timers.close = Some(timer);
        }
    }

    fn shutdown(&mut self) {
        for ws_key in self.store.keys() {
            let Some(record) = self.store.get_mut(ws_key) else {
                continue;
            };
            record.timers.clear_all();
            if let Some(task) = record.connect_task.take() {
                task.abort();
            }
            if let Some(socket) = record.socket.take()
                && socket.close().is_err()
            {
                socket.terminate();
            }
            record
                .pending
                .reject_all(|| WsError::Disconnected { ws_key });
            if let Some(deferred) = record.in_progress.take() {
                deferred.reject(|| WsError::Disconnected { ws_key });
            }
            record.state = ConnectionState::Initial;
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn is_current_socket(&self, ws_key: WsKey, epoch: ConnectionEpoch) -> bool {
        self.store
            .get(ws_key)
            .is_some_and(|c| c.epoch == epoch && c.socket.is_some())
    }

    fn next_timer_id(&mut self) -> u64 {
        self.next_timer_id += 1;
        self.next_timer_id
    }

    fn spawn_timer(
        &mut self,
        delay: Duration,
        event_for: impl FnOnce(u64) -> InternalEvent,
    ) -> Timer {
        let timer_id = self.next_timer_id();
        let event = event_for(timer_id);
        let events = self.internal_tx.clone();
        let task = tokio::spawn(async move {
            sleep(delay).await;
            let _ = events.send(event);
        });
        Timer::new(timer_id, task.abort_handle())
    }

    /// Send on the key's socket; failures are logged, never retried.
    pub(crate) fn send_or_log(&self, ws_key: WsKey, message: &WsMessage, what: &str) -> bool {
        let Some(socket) = self.store.socket(ws_key) else {
            warn!(ws_key = %ws_key, "Cannot send {what}, no active socket");
            return false;
        };
        match socket.send(message) {
            Ok(()) => true,
            Err(e) => {
                warn!(ws_key = %ws_key, error = %e, "Failed to send {what}");
                false
            }
        }
    }

    pub(crate) fn emit(&self, event: WsEvent) {
        trace!(ws_key = %event.ws_key(), event = event.name(), "Emitting event");
        // No receivers is fine.
        let _ = self.event_tx.send(event);
    }
}
