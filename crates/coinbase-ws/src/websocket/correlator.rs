//! Request/response correlation over a key's socket.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use serde_json::Value;
use tracing::{trace, warn};

use super::{
    actor::ConnectionActor,
    pending::Responder,
    protocol::{ExchangeAdapter, WsMessage},
    types::{EmittableKind, RequestId, WsKey},
};
use crate::error::WsError;

static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Allocate the next request id. Ids are process-wide, start at 1 and are
/// never reused.
pub fn next_request_id() -> RequestId {
    RequestId::new(REQUEST_ID_COUNTER.fetch_add(1, Ordering::Relaxed) + 1)
}

impl<A: ExchangeAdapter> ConnectionActor<A> {
    /// Register a pending request and send it.
    pub(crate) fn send_request(
        &mut self,
        ws_key: WsKey,
        request_id: RequestId,
        message: WsMessage,
        timeout: Duration,
        responder: Responder,
    ) {
        if !self.store.is_ws_open(ws_key) {
            let _ = responder.send(Err(WsError::NotConnected { ws_key }));
            return;
        }
        let Some(record) = self.store.get_mut(ws_key) else {
            return;
        };
        if !record.pending.add(request_id, responder, timeout) {
            warn!(ws_key = %ws_key, %request_id, "Request rejected by pending table");
            return;
        }

        let sent = match record.socket.as_ref() {
            Some(socket) => socket.send(&message),
            None => Err(WsError::NotConnected { ws_key }),
        };
        match sent {
            Ok(()) => trace!(ws_key = %ws_key, %request_id, "Sent request"),
            Err(e) => {
                warn!(ws_key = %ws_key, %request_id, error = %e, "Failed to send request");
                record.pending.resolve(&request_id, Err(e));
            }
        }
    }

    /// Settle the pending request a response belongs to.
    pub(crate) fn resolve_request(
        &mut self,
        ws_key: WsKey,
        request_id: RequestId,
        kind: &EmittableKind,
        event: &Value,
    ) {
        let Some(record) = self.store.get_mut(ws_key) else {
            return;
        };
        let response = if kind.is_exception() {
            Err(WsError::RequestRejected {
                request_id,
                event: event.clone(),
            })
        } else {
            Ok(event.clone())
        };
        if !record.pending.resolve(&request_id, response) {
            trace!(ws_key = %ws_key, %request_id, "No pending request for response");
        }
    }

    /// Expire requests that outlived their timeout.
    pub(crate) fn cleanup_stale_requests(&mut self) {
        for ws_key in self.store.keys() {
            let Some(record) = self.store.get_mut(ws_key) else {
                continue;
            };
            let expired = record.pending.cleanup_stale_with_notify();
            if expired > 0 {
                warn!(ws_key = %ws_key, expired, "Pending requests timed out");
            }
        }
    }
}
