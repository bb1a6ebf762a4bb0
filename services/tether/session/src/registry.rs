//! Server-side session registry.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use dashmap::DashMap;
use futures::future::join_all;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::broker::ReconnectBroker;
use crate::error::{Result, SessionError};
use crate::events::{ChangeReason, HostEvent, Subject};
use crate::handler::{Handler, StopMode};
use crate::ids::{ClientId, HandlerId};

/// Connected sessions by client id
#[derive(Debug)]
pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<ConnectedClient>>,
    events: broadcast::Sender<HostEvent>,
}

impl ClientRegistry {
    /// Create a registry publishing its changes on `events`
    pub fn new(events: broadcast::Sender<HostEvent>) -> Arc<Self> {
        Arc::new(Self {
            clients: DashMap::new(),
            events,
        })
    }

    /// Mint a client id and register a session for it
    pub fn create_client(self: &Arc<Self>) -> Arc<ConnectedClient> {
        let id = ClientId::new();
        let client = Arc::new(ConnectedClient {
            id,
            handlers: DashMap::new(),
            membership: Mutex::new(Membership::Open),
            broker: Arc::new(ReconnectBroker::new()),
            registry: Arc::downgrade(self),
            events: self.events.clone(),
        });
        self.clients.insert(id, client.clone());
        info!("Client {} connected", id);
        self.publish(ChangeReason::ClientAdded, Subject::Client(id));
        client
    }

    /// Look up a session
    pub fn get(&self, id: &ClientId) -> Option<Arc<ConnectedClient>> {
        self.clients.get(id).map(|entry| entry.value().clone())
    }

    /// Number of live sessions
    pub fn count(&self) -> usize {
        self.clients.len()
    }

    /// Drop a session; returns it when it was registered
    pub fn remove(&self, id: &ClientId) -> Option<Arc<ConnectedClient>> {
        let removed = self.clients.remove(id).map(|(_, client)| client);
        if removed.is_some() {
            info!("Client {} disconnected", id);
            self.publish(ChangeReason::ClientRemoved, Subject::Client(*id));
        }
        removed
    }

    /// Soft-stop every handler of every session
    pub async fn close_all(&self) {
        let clients: Vec<Arc<ConnectedClient>> =
            self.clients.iter().map(|entry| entry.value().clone()).collect();
        join_all(clients.iter().map(|client| client.close())).await;
        for client in clients {
            client.retire();
        }
    }

    /// Subscribe to session and handler changes
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    fn publish(&self, reason: ChangeReason, subject: Subject) {
        // No subscribers is fine
        let _ = self.events.send(HostEvent::new(reason, subject));
    }
}

/// Whether a session still accepts handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Membership {
    Open,
    Removed,
}

/// One client session and the handlers serving it
#[derive(Debug)]
pub struct ConnectedClient {
    id: ClientId,
    handlers: DashMap<HandlerId, Arc<Handler>>,
    // Held across handler insert and last-handler removal
    membership: Mutex<Membership>,
    broker: Arc<ReconnectBroker<TcpStream>>,
    registry: Weak<ClientRegistry>,
    events: broadcast::Sender<HostEvent>,
}

impl ConnectedClient {
    /// Session id
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Broker matching this session's reconnecting channels
    pub fn broker(&self) -> Arc<ReconnectBroker<TcpStream>> {
        self.broker.clone()
    }

    /// Add a handler to the session.
    ///
    /// Fails with [`SessionError::ClientNotFound`] once the session has lost
    /// its last handler and left the registry.
    pub fn register_handler(&self, handler: Arc<Handler>) -> Result<()> {
        let id = handler.id();
        {
            let membership = self.lock_membership();
            if *membership == Membership::Removed {
                warn!("Client {} is gone; handler {} not registered", self.id, id);
                return Err(SessionError::ClientNotFound(self.id));
            }
            self.handlers.insert(id, handler);
        }
        debug!("Handler {} registered with client {}", id, self.id);
        let _ = self
            .events
            .send(HostEvent::new(ChangeReason::HandlerAdded, Subject::Handler(id)));
        Ok(())
    }

    /// Whether the session has left the registry
    pub fn is_removed(&self) -> bool {
        *self.lock_membership() == Membership::Removed
    }

    /// Look up a handler
    pub fn handler(&self, id: &HandlerId) -> Option<Arc<Handler>> {
        self.handlers.get(id).map(|entry| entry.value().clone())
    }

    /// Number of live handlers
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Stop one of this session's handlers
    pub async fn stop_handler(&self, id: HandlerId, mode: StopMode) -> Result<()> {
        // Release the map entry before awaiting the stop
        let Some(handler) = self.handler(&id) else {
            warn!("Client {}: no handler {} to stop", self.id, id);
            return Err(SessionError::HandlerNotFound(id));
        };
        handler.stop(mode).await;
        Ok(())
    }

    /// Forget a handler; the session goes with its last handler
    pub fn remove_handler(&self, id: HandlerId) {
        let last = {
            let mut membership = self.lock_membership();
            if self.handlers.remove(&id).is_none() {
                return;
            }
            let last = self.handlers.is_empty();
            if last {
                *membership = Membership::Removed;
            }
            last
        };
        self.broker.cancel(&id);
        debug!("Handler {} removed from client {}", id, self.id);
        let _ = self
            .events
            .send(HostEvent::new(ChangeReason::HandlerRemoved, Subject::Handler(id)));

        if last {
            self.leave_registry();
        }
    }

    /// Take the session out of the registry and refuse further handlers
    pub(crate) fn retire(&self) {
        *self.lock_membership() = Membership::Removed;
        self.leave_registry();
    }

    fn leave_registry(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.id);
        }
    }

    fn lock_membership(&self) -> MutexGuard<'_, Membership> {
        self.membership
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Soft-stop every handler
    pub async fn close(&self) {
        let handlers: Vec<Arc<Handler>> =
            self.handlers.iter().map(|entry| entry.value().clone()).collect();
        join_all(handlers.iter().map(|handler| handler.stop(StopMode::Soft))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::config::SessionConfig;
    use crate::handler::{CommandHandler, HandlerContext};
    use async_trait::async_trait;
    use tether_wire::Frame;
    use tokio::net::TcpListener;

    struct Idle;

    #[async_trait]
    impl CommandHandler for Idle {
        async fn handle(&self, _frame: Frame, _ctx: &HandlerContext<'_>) -> Result<()> {
            Ok(())
        }
    }

    /// Server end of a fresh loopback connection, plus the client end to keep it open
    async fn accepted_channel() -> (Arc<Channel>, Arc<Channel>) {
        let config = Arc::new(SessionConfig::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(Channel::open(addr, config.clone()), listener.accept());
        let server = Channel::accepted(accepted.unwrap().0, config).unwrap();
        (client.unwrap(), server)
    }

    async fn idle_handler(session: &Arc<ConnectedClient>) -> (Arc<Channel>, Arc<Handler>) {
        let (peer, server) = accepted_channel().await;
        let handler = Handler::new(HandlerId::new(), session, "idle", server, Arc::new(Idle));
        (peer, handler)
    }

    #[tokio::test]
    async fn test_create_and_remove_clients() {
        let (events, _) = broadcast::channel(16);
        let registry = ClientRegistry::new(events);
        let mut rx = registry.subscribe();

        let first = registry.create_client();
        let second = registry.create_client();
        assert_ne!(first.id(), second.id());
        assert_eq!(registry.count(), 2);
        assert!(registry.get(&first.id()).is_some());

        assert!(registry.remove(&first.id()).is_some());
        assert!(registry.remove(&first.id()).is_none());
        assert_eq!(registry.count(), 1);

        let reasons: Vec<ChangeReason> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|event| event.reason)
            .collect();
        assert_eq!(
            reasons,
            vec![
                ChangeReason::ClientAdded,
                ChangeReason::ClientAdded,
                ChangeReason::ClientRemoved
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_unknown_handler() {
        let (events, _) = broadcast::channel(16);
        let registry = ClientRegistry::new(events);
        let client = registry.create_client();
        let missing = HandlerId::new();

        match client.stop_handler(missing, StopMode::Soft).await {
            Err(SessionError::HandlerNotFound(id)) => assert_eq!(id, missing),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(client.handler_count(), 0);
    }

    #[tokio::test]
    async fn test_join_after_last_handler_left() {
        let (events, _) = broadcast::channel(16);
        let registry = ClientRegistry::new(events);
        let session = registry.create_client();
        let (_peer, first) = idle_handler(&session).await;
        session.register_handler(first.clone()).unwrap();

        // Looked up by a joining channel, then emptied before it registers
        let looked_up = registry.get(&session.id()).unwrap();
        first.stop(StopMode::Hard).await;
        assert!(registry.get(&session.id()).is_none());
        assert!(looked_up.is_removed());

        let (_late_peer, late) = idle_handler(&looked_up).await;
        match looked_up.register_handler(late) {
            Err(SessionError::ClientNotFound(id)) => assert_eq!(id, session.id()),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(looked_up.handler_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_join_and_last_stop() {
        let (events, _) = broadcast::channel(1024);
        let registry = ClientRegistry::new(events);

        for _ in 0..20 {
            let session = registry.create_client();
            let (_peer, first) = idle_handler(&session).await;
            session.register_handler(first.clone()).unwrap();
            let (_joining_peer, joining) = idle_handler(&session).await;

            let stop = tokio::spawn(async move { first.stop(StopMode::Hard).await });
            let join = {
                let session = session.clone();
                tokio::spawn(async move { session.register_handler(joining) })
            };
            stop.await.unwrap();
            let joined = join.await.unwrap();

            // A registered handler is always reachable through the registry
            match joined {
                Ok(()) => {
                    assert!(registry.get(&session.id()).is_some());
                    assert_eq!(session.handler_count(), 1);
                }
                Err(SessionError::ClientNotFound(_)) => {
                    assert!(registry.get(&session.id()).is_none());
                    assert_eq!(session.handler_count(), 0);
                }
                Err(e) => panic!("unexpected {:?}", e),
            }
            registry.remove(&session.id());
        }
    }
}
