//! Registry of per-key connection records.
//!
//! Pure bookkeeping: nothing in here performs I/O. Lookups on unknown keys
//! yield `None`, empty collections or `false`.

use std::collections::BTreeMap;

use tokio::task::AbortHandle;

use super::{
    deferred::Deferred,
    pending::PendingRequests,
    subscription::TopicSet,
    transport::{ConnectionEpoch, SocketHandle},
    types::{ConnectionState, TopicRequest, WsKey},
};
use crate::error::WsError;

/// A spawned timer task, identified so late firings can be recognised.
#[derive(Debug)]
pub(crate) struct Timer {
    pub(crate) id: u64,
    handle: AbortHandle,
}

impl Timer {
    pub(crate) fn new(id: u64, handle: AbortHandle) -> Self {
        Self { id, handle }
    }

    pub(crate) fn cancel(self) {
        self.handle.abort();
    }
}

#[derive(Debug, Default)]
pub(crate) struct WsTimers {
    pub(crate) ping: Option<Timer>,
    pub(crate) pong: Option<Timer>,
    pub(crate) reconnect: Option<Timer>,
    pub(crate) close: Option<Timer>,
}

impl WsTimers {
    pub(crate) fn clear_pong(&mut self) -> bool {
        match self.pong.take() {
            Some(timer) => {
                timer.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn clear_all(&mut self) {
        for timer in [
            self.ping.take(),
            self.pong.take(),
            self.reconnect.take(),
            self.close.take(),
        ]
        .into_iter()
        .flatten()
        {
            timer.cancel();
        }
    }
}

/// Runtime record of one key.
#[derive(Debug)]
pub struct WsConnection {
    pub(crate) state: ConnectionState,
    pub(crate) socket: Option<SocketHandle>,
    pub(crate) epoch: ConnectionEpoch,
    pub(crate) is_authenticated: bool,
    pub(crate) topics: TopicSet,
    pub(crate) timers: WsTimers,
    pub(crate) connect_task: Option<AbortHandle>,
    pub(crate) in_progress: Option<Deferred<WsKey>>,
    pub(crate) pending: PendingRequests,
    /// The next open follows a scheduled reconnect.
    pub(crate) reconnect_pending: bool,
}

impl WsConnection {
    fn new(max_pending: usize) -> Self {
        Self {
            state: ConnectionState::Initial,
            socket: None,
            epoch: ConnectionEpoch::default(),
            is_authenticated: false,
            topics: TopicSet::new(),
            timers: WsTimers::default(),
            connect_task: None,
            in_progress: None,
            pending: PendingRequests::new(max_pending),
            reconnect_pending: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.is_authenticated
    }

    pub fn topics(&self) -> &TopicSet {
        &self.topics
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// In-memory table of connection records keyed by [`WsKey`].
#[derive(Debug)]
pub struct WsStore {
    connections: BTreeMap<WsKey, WsConnection>,
    max_pending: usize,
}

impl WsStore {
    /// Create an empty registry; new records allow `max_pending` requests.
    pub fn new(max_pending: usize) -> Self {
        Self {
            connections: BTreeMap::new(),
            max_pending,
        }
    }

    pub fn get(&self, ws_key: WsKey) -> Option<&WsConnection> {
        self.connections.get(&ws_key)
    }

    pub fn get_mut(&mut self, ws_key: WsKey) -> Option<&mut WsConnection> {
        self.connections.get_mut(&ws_key)
    }

    /// Fetch the record for a key, creating an `Initial` one if absent.
    pub fn get_or_create(&mut self, ws_key: WsKey) -> &mut WsConnection {
        let max_pending = self.max_pending;
        self.connections
            .entry(ws_key)
            .or_insert_with(|| WsConnection::new(max_pending))
    }

    /// Keys with a record, in a stable order.
    pub fn keys(&self) -> Vec<WsKey> {
        self.connections.keys().copied().collect()
    }

    pub fn connection_state(&self, ws_key: WsKey) -> Option<ConnectionState> {
        self.get(ws_key).map(|c| c.state)
    }

    pub fn set_connection_state(&mut self, ws_key: WsKey, state: ConnectionState) {
        self.get_or_create(ws_key).state = state;
    }

    pub fn is_connection_state(&self, ws_key: WsKey, state: ConnectionState) -> bool {
        self.connection_state(ws_key) == Some(state)
    }

    /// True when a socket exists and the key is connected.
    pub fn is_ws_open(&self, ws_key: WsKey) -> bool {
        self.get(ws_key)
            .is_some_and(|c| c.socket.is_some() && c.state == ConnectionState::Connected)
    }

    pub fn is_connection_attempt_in_progress(&self, ws_key: WsKey) -> bool {
        self.get(ws_key)
            .is_some_and(|c| c.state.is_attempt_in_progress())
    }

    /// Record a desired subscription. Returns `true` if it was new.
    pub fn add_topic(&mut self, ws_key: WsKey, topic: TopicRequest) -> bool {
        self.get_or_create(ws_key).topics.insert(topic)
    }

    /// Forget a desired subscription. Returns `true` if it was present.
    pub fn remove_topic(&mut self, ws_key: WsKey, topic: &TopicRequest) -> bool {
        self.get_mut(ws_key)
            .is_some_and(|c| c.topics.remove(topic))
    }

    /// Desired subscriptions in registration order.
    pub fn topics(&self, ws_key: WsKey) -> Vec<TopicRequest> {
        self.get(ws_key)
            .map(|c| c.topics.to_vec())
            .unwrap_or_default()
    }

    /// Install the socket for a key, returning any handle it replaces.
    pub fn set_socket(&mut self, ws_key: WsKey, socket: SocketHandle) -> Option<SocketHandle> {
        self.get_or_create(ws_key).socket.replace(socket)
    }

    pub fn take_socket(&mut self, ws_key: WsKey) -> Option<SocketHandle> {
        self.get_mut(ws_key).and_then(|c| c.socket.take())
    }

    pub fn socket(&self, ws_key: WsKey) -> Option<&SocketHandle> {
        self.get(ws_key).and_then(|c| c.socket.as_ref())
    }

    /// Ensure the key has an in-progress completion handle and return it.
    pub fn create_in_progress_promise(&mut self, ws_key: WsKey) -> &mut Deferred<WsKey> {
        self.get_or_create(ws_key)
            .in_progress
            .get_or_insert_with(Deferred::new)
    }

    pub fn in_progress_promise(&mut self, ws_key: WsKey) -> Option<&mut Deferred<WsKey>> {
        self.get_mut(ws_key).and_then(|c| c.in_progress.as_mut())
    }

    /// Remove the in-progress handle so it can be settled.
    pub fn clear_in_progress_promise(&mut self, ws_key: WsKey) -> Option<Deferred<WsKey>> {
        self.get_mut(ws_key).and_then(|c| c.in_progress.take())
    }

    /// Reject every pending request of a key. Returns how many were rejected.
    pub fn reject_all_pending(&mut self, ws_key: WsKey, make_error: impl Fn() -> WsError) -> usize {
        self.get_mut(ws_key)
            .map(|c| c.pending.reject_all(make_error))
            .unwrap_or(0)
    }
}
