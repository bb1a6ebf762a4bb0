//! Reconnect broker.
//!
//! An acceptor whose channel broke registers a waiter under the channel's
//! handler id. When the initiator comes back with `RECONNECT`, the accepting
//! loop resolves that waiter with the fresh socket.

use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Result, SessionError};
use crate::ids::HandlerId;

/// Result of waiting for a replacement connection
#[derive(Debug)]
pub enum WaitOutcome<T> {
    /// A matching replacement arrived
    Resolved(T),
    /// Nothing arrived before the timeout
    TimedOut,
}

/// Single-use waiters keyed by handler id
#[derive(Debug)]
pub struct ReconnectBroker<T = TcpStream> {
    waiters: DashMap<HandlerId, oneshot::Sender<T>>,
}

impl<T> Default for ReconnectBroker<T> {
    fn default() -> Self {
        Self {
            waiters: DashMap::new(),
        }
    }
}

impl<T: Send> ReconnectBroker<T> {
    /// Create an empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait up to `timeout` for [`resolve`](Self::resolve) to hand over a
    /// replacement for `handler_id`.
    ///
    /// Only one waiter per handler id may be pending; a second registration
    /// fails with [`SessionError::DuplicateWaiter`].
    pub async fn register(&self, handler_id: HandlerId, timeout: Duration) -> Result<WaitOutcome<T>> {
        let (tx, mut rx) = oneshot::channel();
        match self.waiters.entry(handler_id) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_closed() {
                    return Err(SessionError::DuplicateWaiter(handler_id));
                }
                // Left behind by a waiter that was dropped mid-wait
                occupied.insert(tx);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(tx);
            }
        }
        debug!("Waiting up to {:?} for handler {} to reconnect", timeout, handler_id);

        let outcome = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(value)) => WaitOutcome::Resolved(value),
            Ok(Err(_)) => WaitOutcome::TimedOut,
            Err(_) => {
                // Refuse late resolves, then keep one that landed before the close
                rx.close();
                match rx.try_recv() {
                    Ok(value) => WaitOutcome::Resolved(value),
                    Err(_) => WaitOutcome::TimedOut,
                }
            }
        };
        self.waiters.remove_if(&handler_id, |_, tx| tx.is_closed());
        Ok(outcome)
    }

    /// Hand `value` to the waiter registered for `handler_id`.
    ///
    /// Returns `Err(value)` when no live waiter exists, so the caller keeps
    /// the socket and can refuse the request.
    pub fn resolve(&self, handler_id: HandlerId, value: T) -> std::result::Result<(), T> {
        match self.waiters.remove(&handler_id) {
            Some((_, tx)) => tx.send(value),
            None => Err(value),
        }
    }

    /// Drop the waiter for `handler_id`, if any
    pub fn cancel(&self, handler_id: &HandlerId) {
        self.waiters.remove(handler_id);
    }

    /// Whether a waiter is pending for `handler_id`
    pub fn is_waiting(&self, handler_id: &HandlerId) -> bool {
        self.waiters
            .get(handler_id)
            .map_or(false, |tx| !tx.is_closed())
    }

    /// Number of pending waiters
    pub fn pending(&self) -> usize {
        self.waiters.len()
    }
}
