//! Completion handle shared by every caller waiting on one connection attempt.

use tokio::sync::oneshot;

use crate::error::{WsError, WsResult};

/// A one-shot completion handle with any number of waiters.
///
/// `resolve` and `reject` consume the handle, so an attempt can settle at
/// most once. Dropping an unsettled handle wakes every waiter with a closed
/// channel.
#[derive(Debug)]
pub struct Deferred<T> {
    waiters: Vec<oneshot::Sender<WsResult<T>>>,
}

impl<T: Clone> Deferred<T> {
    pub fn new() -> Self {
        Self {
            waiters: Vec::new(),
        }
    }

    /// Register a waiter.
    pub fn subscribe(&mut self) -> oneshot::Receiver<WsResult<T>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.push(tx);
        rx
    }

    /// Attach an existing responder as a waiter.
    pub fn attach(&mut self, responder: oneshot::Sender<WsResult<T>>) {
        self.waiters.push(responder);
    }

    /// Settle successfully, waking every waiter with a clone of `value`.
    pub fn resolve(self, value: T) {
        for waiter in self.waiters {
            let _ = waiter.send(Ok(value.clone()));
        }
    }

    /// Settle with an error built once per waiter.
    pub fn reject(self, make_error: impl Fn() -> WsError) {
        for waiter in self.waiters {
            let _ = waiter.send(Err(make_error()));
        }
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }
}

impl<T: Clone> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}
