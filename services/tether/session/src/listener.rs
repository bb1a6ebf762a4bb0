//! Server-initiated notifications on the primary channel.
//!
//! A host handler can push a frame to its client at any time. The frame's
//! command code says what happened and its payload names the handler it
//! concerns. Once started, a [`ClientListener`] owns the receiving side of the
//! primary channel and routes each notification to the callback registered
//! for its `(handler id, command)` pair.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tether_wire::{CborCodec, Frame, WireError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::error::{Result, SessionError};
use crate::ids::HandlerId;

/// A pushed frame: `command` concerning handler `handler_id`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    /// Handler the notification concerns
    pub handler_id: HandlerId,
    /// Application command code
    pub command: i16,
}

impl Notification {
    /// Encode for sending on a primary channel
    pub fn to_frame(&self) -> Result<Frame> {
        Ok(Frame::with_value(self.command, &self.handler_id, &CborCodec)?)
    }

    /// Decode a pushed frame
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let command = frame.command().ok_or(WireError::MissingCommand)?;
        Ok(Self {
            handler_id: frame.value(&CborCodec)?,
            command,
        })
    }
}

/// Client-side reaction to one kind of notification
#[async_trait]
pub trait NotificationCallback: Send + Sync {
    /// Called once per matching notification, in arrival order
    async fn notify(&self, notification: Notification);
}

type CallbackMap = DashMap<(HandlerId, i16), Arc<dyn NotificationCallback>>;

/// Routes notifications arriving on the primary channel
pub struct ClientListener {
    channel: Arc<Channel>,
    callbacks: Arc<CallbackMap>,
    shutdown: CancellationToken,
    started: AtomicBool,
}

impl ClientListener {
    pub(crate) fn new(channel: Arc<Channel>) -> Self {
        Self {
            channel,
            callbacks: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Spawn the receive loop; later calls do nothing.
    ///
    /// From then on every frame arriving on the primary channel is treated
    /// as a notification.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("{}: listening for notifications", self.channel.context());
        tokio::spawn(listen(
            self.channel.clone(),
            self.callbacks.clone(),
            self.shutdown.clone(),
        ));
    }

    /// Whether the receive loop was started and has not been stopped
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.shutdown.is_cancelled()
    }

    /// Route `command` from `handler_id` to `callback`; returns the callback it replaced
    pub fn register(
        &self,
        handler_id: HandlerId,
        command: i16,
        callback: Arc<dyn NotificationCallback>,
    ) -> Option<Arc<dyn NotificationCallback>> {
        self.callbacks.insert((handler_id, command), callback)
    }

    /// Remove the callback for `command` from `handler_id`
    pub fn unregister(&self, handler_id: HandlerId, command: i16) -> Result<()> {
        self.callbacks
            .remove(&(handler_id, command))
            .map(|_| ())
            .ok_or(SessionError::CallbackNotFound {
                handler_id,
                command,
            })
    }

    /// Number of registered callbacks
    pub fn callback_count(&self) -> usize {
        self.callbacks.len()
    }

    /// End the receive loop. The primary channel must be closed afterwards,
    /// since a frame may have been cut off mid-read.
    pub(crate) fn stop(&self) {
        self.shutdown.cancel();
    }
}

async fn listen(channel: Arc<Channel>, callbacks: Arc<CallbackMap>, shutdown: CancellationToken) {
    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = channel.receive_frame() => received,
        };
        let frame = match received {
            Ok(frame) => frame,
            Err(SessionError::Closed) => break,
            Err(e) => {
                warn!("{}: notification listener stopped: {}", channel.context(), e);
                break;
            }
        };

        let notification = match Notification::from_frame(&frame) {
            Ok(notification) => notification,
            Err(e) => {
                warn!("{}: dropped malformed notification: {}", channel.context(), e);
                continue;
            }
        };
        // Clone out of the map so a callback may register or unregister
        let callback = callbacks
            .get(&(notification.handler_id, notification.command))
            .map(|entry| entry.value().clone());
        match callback {
            Some(callback) => callback.notify(notification).await,
            None => debug!(
                "{}: no callback for command {} from handler {}",
                channel.context(),
                notification.command,
                notification.handler_id
            ),
        }
    }
    debug!("{}: notification listener finished", channel.context());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_frame() {
        let notification = Notification {
            handler_id: HandlerId::new(),
            command: 310,
        };
        let frame = notification.to_frame().unwrap();
        assert_eq!(frame.command(), Some(310));
        assert_eq!(Notification::from_frame(&frame).unwrap(), notification);
    }

    #[test]
    fn test_notification_needs_handler_id() {
        let frame = Frame::control(310).unwrap();
        assert!(Notification::from_frame(&frame).is_err());
    }
}
