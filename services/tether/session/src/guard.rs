//! Liveness probing and exclusive access for channels.
//!
//! Each initialized channel runs one probe timer. When it fires on an idle,
//! connected channel the initiator sends a header-only probe frame and the
//! acceptor peeks for one. Callers in the probe's direction wait for it to
//! finish, and any failure it recorded is raised to every later caller.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{watch, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{trace, warn};

use crate::channel::{Channel, Role};
use crate::error::{FailureKind, Result, SessionError};

/// Which way an operation moves bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Send,
    Receive,
}

/// Probe-in-progress signal plus the sticky failure of a channel
pub(crate) struct Liveness {
    probing: watch::Sender<bool>,
    probe_direction: Direction,
    failure: Mutex<Option<(FailureKind, String)>>,
}

impl Liveness {
    pub(crate) fn new(role: Role) -> Self {
        let (probing, _) = watch::channel(false);
        let probe_direction = match role {
            Role::Initiator => Direction::Send,
            Role::Acceptor => Direction::Receive,
        };
        Self {
            probing,
            probe_direction,
            failure: Mutex::new(None),
        }
    }

    /// Wait out a probe moving bytes the same way, then raise any recorded failure
    pub(crate) async fn wait_ready(&self, direction: Direction) -> Result<()> {
        if direction == self.probe_direction {
            let mut ready = self.probing.subscribe();
            // The sender lives as long as `self`
            let _ = ready.wait_for(|probing| !*probing).await;
        }
        self.check().await
    }

    pub(crate) async fn check(&self) -> Result<()> {
        match &*self.failure.lock().await {
            Some((kind, reason)) => Err(SessionError::Unusable {
                kind: *kind,
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    pub(crate) async fn record_failure(&self, err: &SessionError) {
        let mut failure = self.failure.lock().await;
        if failure.is_none() {
            *failure = Some((err.kind(), err.to_string()));
        }
    }

    pub(crate) fn begin_probe(&self) {
        self.probing.send_replace(true);
    }

    pub(crate) fn end_probe(&self) {
        self.probing.send_replace(false);
    }

    pub(crate) fn is_probing(&self) -> bool {
        *self.probing.borrow()
    }
}

/// Counting gate serializing exclusive exchanges on one channel.
///
/// The first entrant proceeds at once and later entrants wait until the
/// holder leaves. Ordinary sends take the gate in shared mode, so they never
/// interleave with an exclusive exchange.
#[derive(Debug, Default)]
pub struct ExclusiveGate {
    lock: RwLock<()>,
    entrants: AtomicUsize,
}

impl ExclusiveGate {
    /// Enter exclusively, waiting for the current holder to leave
    pub async fn enter(&self) -> GateGuard<'_> {
        let ticket = Ticket::new(&self.entrants);
        let guard = self.lock.write().await;
        GateGuard {
            _guard: guard,
            _ticket: ticket,
        }
    }

    pub(crate) async fn shared(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read().await
    }

    /// Holder plus waiters currently inside [`enter`](Self::enter)
    pub fn entrants(&self) -> usize {
        self.entrants.load(Ordering::Acquire)
    }
}

/// Exclusive hold on an [`ExclusiveGate`]; released on drop
pub struct GateGuard<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
    _ticket: Ticket<'a>,
}

struct Ticket<'a>(&'a AtomicUsize);

impl<'a> Ticket<'a> {
    fn new(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::AcqRel);
        Self(count)
    }
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Start the probe timer for a freshly initialized channel.
///
/// The task holds only a weak reference and ends when the channel is closed
/// or dropped, or after the first failed probe.
pub(crate) fn spawn_probe(channel: &Arc<Channel>) {
    let weak: Weak<Channel> = Arc::downgrade(channel);
    let period = channel.config().probe_interval;
    let closed = channel.closed_token();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = closed.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(channel) = weak.upgrade() else {
                break;
            };
            if channel.is_transfer_active() || !channel.is_connected() {
                trace!("{}: skipping probe on busy or disconnected channel", channel.context());
                continue;
            }
            if let Err(e) = channel.probe().await {
                if !matches!(e, SessionError::Closed) {
                    warn!("{}: liveness probe failed: {}", channel.context(), e);
                }
                break;
            }
        }
    });
}
