//! Topic subscription coordination.
//!
//! Subscriptions are recorded as desired state first and sent on the wire
//! only when the connection can take them. Anything recorded while the key
//! is offline, connecting or waiting for auth is replayed by the ready
//! sequence in the actor.

use tracing::{debug, trace, warn};

use super::{
    actor::ConnectionActor,
    protocol::{ExchangeAdapter, WsMessage},
    types::{ConnectionState, TopicRequest, WsKey, WsOperation},
};
use crate::error::{WsError, WsResult};

impl<A: ExchangeAdapter> ConnectionActor<A> {
    /// Record topics as desired and send them if the connection is ready.
    pub(crate) fn subscribe_topics(
        &mut self,
        ws_key: WsKey,
        topics: Vec<TopicRequest>,
    ) -> WsResult<()> {
        if topics.is_empty() {
            return Ok(());
        }
        // Closing keys never reconnect.
        if self
            .store
            .is_connection_state(ws_key, ConnectionState::Closing)
        {
            warn!(ws_key = %ws_key, "Refused to subscribe while the connection is closing");
            return Err(WsError::Disconnected { ws_key });
        }
        for topic in &topics {
            self.store.add_topic(ws_key, topic.clone());
        }

        let is_open = self.store.is_ws_open(ws_key);
        if !is_open && !self.store.is_connection_attempt_in_progress(ws_key) {
            debug!(ws_key = %ws_key, "Not connected, connecting before subscribing");
            self.connect(ws_key, None);
            return Ok(());
        }
        if !is_open {
            trace!(
                ws_key = %ws_key,
                count = topics.len(),
                "Connection attempt in progress, topics queued"
            );
            return Ok(());
        }
        if !self.is_ready_for_topics(ws_key) {
            trace!(ws_key = %ws_key, count = topics.len(), "Connection not ready, topics queued");
            return Ok(());
        }

        self.send_topic_operation_checked(ws_key, &topics, WsOperation::Subscribe)
    }

    /// Forget topics and send the unsubscribe if the connection is ready.
    pub(crate) fn unsubscribe_topics(
        &mut self,
        ws_key: WsKey,
        topics: Vec<TopicRequest>,
    ) -> WsResult<()> {
        if topics.is_empty() {
            return Ok(());
        }
        for topic in &topics {
            self.store.remove_topic(ws_key, topic);
        }

        if !self.store.is_ws_open(ws_key) {
            trace!(ws_key = %ws_key, "Not connected, unsubscribe recorded only");
            return Ok(());
        }
        if !self.is_ready_for_topics(ws_key) {
            trace!(ws_key = %ws_key, "Connection not ready, unsubscribe recorded only");
            return Ok(());
        }

        self.send_topic_operation_checked(ws_key, &topics, WsOperation::Unsubscribe)
    }

    /// An open socket can carry topic traffic once the ready sequence ran and,
    /// for auth-handshake keys, the server confirmed authentication.
    fn is_ready_for_topics(&self, ws_key: WsKey) -> bool {
        let Some(record) = self.store.get(ws_key) else {
            return false;
        };
        if record.in_progress.is_some() {
            return false;
        }
        !self.requires_auth_handshake(ws_key) || record.is_authenticated()
    }

    fn send_topic_operation_checked(
        &mut self,
        ws_key: WsKey,
        topics: &[TopicRequest],
        operation: WsOperation,
    ) -> WsResult<()> {
        let messages = self
            .adapter
            .build_operation_messages(topics, ws_key, operation)?;
        self.send_all(ws_key, &messages, operation);
        Ok(())
    }

    /// Batch and send a topic operation. Build failures are logged.
    pub(crate) fn send_topic_operation(
        &mut self,
        ws_key: WsKey,
        topics: &[TopicRequest],
        operation: WsOperation,
    ) {
        if let Err(e) = self.send_topic_operation_checked(ws_key, topics, operation) {
            warn!(
                ws_key = %ws_key,
                operation = operation.as_str(),
                error = %e,
                "Failed to build topic request"
            );
        }
    }

    fn send_all(&self, ws_key: WsKey, messages: &[WsMessage], operation: WsOperation) {
        let mut sent = 0;
        for message in messages {
            if self.send_or_log(ws_key, message, operation.as_str()) {
                sent += 1;
            }
        }
        debug!(
            ws_key = %ws_key,
            operation = operation.as_str(),
            sent,
            "Sent topic request"
        );
    }
}
