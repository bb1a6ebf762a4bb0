//! Idle channel pool.
//!
//! Only idle channels are tracked; a channel handed out by
//! [`ConnectionPool::take`] belongs to the caller until it is released.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::error::{Result, SessionError};
use crate::ids::HandlerId;

/// Decides whether an idle channel can serve a request for `key`
pub trait MatchPolicy<K>: Send + Sync {
    /// Whether `channel` is an acceptable answer to a request for `key`
    fn matches(&self, key: &K, channel: &Channel) -> bool;
}

/// Matches on the channel's remote port
#[derive(Debug, Clone, Copy, Default)]
pub struct RemotePortPolicy;

impl MatchPolicy<u16> for RemotePortPolicy {
    fn matches(&self, key: &u16, channel: &Channel) -> bool {
        channel.remote_addr().port() == *key
    }
}

/// Creates a fresh channel when no idle one matches
#[async_trait]
pub trait ChannelFactory<K>: Send + Sync {
    /// Open and bind a channel for `key`
    async fn create(&self, key: &K) -> Result<Arc<Channel>>;
}

/// Idle channels keyed by handler id, matched to requests by a [`MatchPolicy`]
pub struct ConnectionPool<K, P = RemotePortPolicy> {
    idle: DashMap<HandlerId, Arc<Channel>>,
    population: AtomicUsize,
    policy: P,
    factory: Arc<dyn ChannelFactory<K>>,
}

impl<K> ConnectionPool<K, RemotePortPolicy>
where
    RemotePortPolicy: MatchPolicy<K>,
{
    /// Pool matching by remote port
    pub fn new(factory: Arc<dyn ChannelFactory<K>>) -> Self {
        Self::with_policy(factory, RemotePortPolicy)
    }
}

impl<K, P: MatchPolicy<K>> ConnectionPool<K, P> {
    /// Pool with a custom match policy
    pub fn with_policy(factory: Arc<dyn ChannelFactory<K>>, policy: P) -> Self {
        Self {
            idle: DashMap::new(),
            population: AtomicUsize::new(0),
            policy,
            factory,
        }
    }

    /// Remove and return an idle channel matching `key`, or create one.
    ///
    /// Among several matches the first one found wins.
    pub async fn take(&self, key: &K) -> Result<Arc<Channel>> {
        loop {
            let found = self
                .idle
                .iter()
                .find(|entry| self.policy.matches(key, entry.value()))
                .map(|entry| *entry.key());
            let Some(handler_id) = found else {
                break;
            };
            // Another taker may have won the race for this entry
            if let Some((_, channel)) = self.idle.remove(&handler_id) {
                self.population.fetch_sub(1, Ordering::AcqRel);
                debug!("{}: reusing idle channel", channel.context());
                return Ok(channel);
            }
        }

        let channel = self.factory.create(key).await?;
        debug!("{}: created pooled channel", channel.context());
        Ok(channel)
    }

    /// Return a channel to the idle set.
    ///
    /// Releasing a channel that is already idle fails with
    /// [`SessionError::DuplicateRelease`].
    pub fn release(&self, channel: Arc<Channel>) -> Result<()> {
        let handler_id = channel.handler_id()?;
        match self.idle.entry(handler_id) {
            Entry::Occupied(_) => {
                warn!("{}: channel released twice", channel.context());
                Err(SessionError::DuplicateRelease(handler_id))
            }
            Entry::Vacant(vacant) => {
                vacant.insert(channel);
                self.population.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
        }
    }

    /// Number of idle channels
    pub fn idle_count(&self) -> usize {
        self.population.load(Ordering::Acquire)
    }

    /// Remove every idle channel
    pub fn drain(&self) -> Vec<Arc<Channel>> {
        let ids: Vec<HandlerId> = self.idle.iter().map(|entry| *entry.key()).collect();
        ids.into_iter()
            .filter_map(|id| self.idle.remove(&id))
            .map(|(_, channel)| {
                self.population.fetch_sub(1, Ordering::AcqRel);
                channel
            })
            .collect()
    }
}
