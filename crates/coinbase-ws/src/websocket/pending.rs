//! Pending request tracking for one connection.
//!
//! Tracks correlated requests awaiting responses, with timeout cleanup and
//! capacity management. Owned by the connection record, so no locking.

use std::{collections::HashMap, time::Duration};

use serde_json::Value;
use tokio::{sync::oneshot, time::Instant};

use super::types::RequestId;
use crate::error::{WsError, WsResult};

/// Completion side of a correlated request.
pub type Responder = oneshot::Sender<WsResult<Value>>;

/// A pending request awaiting a response.
#[derive(Debug)]
pub struct PendingRequest {
    /// Channel to send the response.
    pub response_tx: Responder,
    /// When this request was created.
    pub created_at: Instant,
    /// Timeout for this specific request.
    pub timeout: Duration,
}

/// Requests in flight on a single connection, keyed by request id.
#[derive(Debug)]
pub struct PendingRequests {
    requests: HashMap<RequestId, PendingRequest>,
    max_pending: usize,
}

impl PendingRequests {
    /// Create an empty table holding at most `max_pending` requests.
    pub fn new(max_pending: usize) -> Self {
        Self {
            requests: HashMap::new(),
            max_pending,
        }
    }

    /// Register a request.
    ///
    /// At capacity, or when the id is already taken, the responder is
    /// answered with an error right away and `false` is returned.
    pub fn add(&mut self, id: RequestId, response_tx: Responder, timeout: Duration) -> bool {
        if self.requests.len() >= self.max_pending {
            let _ = response_tx.send(Err(WsError::capacity_exceeded(format!(
                "max pending requests ({}) reached",
                self.max_pending
            ))));
            return false;
        }
        if self.requests.contains_key(&id) {
            let _ = response_tx.send(Err(WsError::internal(format!(
                "duplicate request id {id}"
            ))));
            return false;
        }

        self.requests.insert(
            id,
            PendingRequest {
                response_tx,
                created_at: Instant::now(),
                timeout,
            },
        );
        true
    }

    /// Resolve a pending request with a response.
    ///
    /// Returns `true` if the request was found and resolved, `false` otherwise.
    pub fn resolve(&mut self, id: &RequestId, response: WsResult<Value>) -> bool {
        if let Some(pending) = self.requests.remove(id) {
            // Receiver may have given up already.
            let _ = pending.response_tx.send(response);
            return true;
        }
        false
    }

    /// Reject stale requests with a timeout error. Returns how many expired.
    pub fn cleanup_stale_with_notify(&mut self) -> usize {
        let now = Instant::now();
        let expired: Vec<RequestId> = self
            .requests
            .iter()
            .filter(|(_, pending)| now.duration_since(pending.created_at) >= pending.timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(pending) = self.requests.remove(id) {
                let _ = pending
                    .response_tx
                    .send(Err(WsError::request_timeout(pending.timeout, *id)));
            }
        }
        expired.len()
    }

    /// Reject every pending request. Returns how many were rejected.
    pub fn reject_all(&mut self, make_error: impl Fn() -> WsError) -> usize {
        let count = self.requests.len();
        for (_, pending) in self.requests.drain() {
            let _ = pending.response_tx.send(Err(make_error()));
        }
        count
    }

    /// Check if there's capacity for more requests.
    pub fn has_capacity(&self) -> bool {
        self.requests.len() < self.max_pending
    }

    /// Get the current number of pending requests.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
