//! Server-side host.
//!
//! A [`Host`] owns the acceptors listening for clients and the registry of
//! sessions they produce.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::info;

use crate::acceptor::Acceptor;
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::events::{ChangeReason, HostEvent, Subject};
use crate::handler::HandlerFactory;
use crate::ids::ClientId;
use crate::registry::{ClientRegistry, ConnectedClient};

const EVENT_CAPACITY: usize = 256;

/// Acceptors plus the sessions they have produced
pub struct Host {
    config: Arc<SessionConfig>,
    registry: Arc<ClientRegistry>,
    acceptors: RwLock<HashMap<u16, Acceptor>>,
    events: broadcast::Sender<HostEvent>,
    open: AtomicBool,
}

impl Host {
    /// Create a closed host with no acceptors
    pub fn new(config: Arc<SessionConfig>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            registry: ClientRegistry::new(events.clone()),
            acceptors: RwLock::new(HashMap::new()),
            events,
            open: AtomicBool::new(false),
        }
    }

    /// Register a listening port.
    ///
    /// On an open host the port starts accepting at once.
    pub async fn add_acceptor(&self, port: u16, factory: Arc<dyn HandlerFactory>) -> Result<()> {
        let mut acceptors = self.acceptors.write().await;
        if acceptors.contains_key(&port) {
            return Err(SessionError::DuplicateAcceptor(port));
        }
        let mut acceptor = Acceptor::new(port, factory);
        if self.is_open() {
            acceptor.start(&self.config, &self.registry)?;
        }
        acceptors.insert(port, acceptor);
        self.publish(ChangeReason::AcceptorAdded, Subject::Port(port));
        Ok(())
    }

    /// Stop and forget a listening port
    pub async fn remove_acceptor(&self, port: u16) -> Result<()> {
        let acceptor = self.acceptors.write().await.remove(&port);
        let mut acceptor = acceptor.ok_or(SessionError::AcceptorNotFound(port))?;
        acceptor.stop().await;
        self.publish(ChangeReason::AcceptorRemoved, Subject::Port(port));
        Ok(())
    }

    /// Start accepting on every registered port
    pub async fn open(&self) -> Result<()> {
        let mut acceptors = self.acceptors.write().await;
        for acceptor in acceptors.values_mut() {
            acceptor.start(&self.config, &self.registry)?;
        }
        self.open.store(true, Ordering::Release);
        info!("Host open with {} acceptor(s)", acceptors.len());
        self.publish(ChangeReason::HostOpened, Subject::Host);
        Ok(())
    }

    /// Stop accepting and soft-stop every session
    pub async fn close(&self) {
        self.open.store(false, Ordering::Release);
        {
            let mut acceptors = self.acceptors.write().await;
            for acceptor in acceptors.values_mut().filter(|a| a.is_running()) {
                acceptor.stop().await;
            }
        }
        self.registry.close_all().await;
        info!("Host closed");
        self.publish(ChangeReason::HostClosed, Subject::Host);
    }

    /// Whether the host is accepting connections
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Number of live sessions
    pub fn connected_client_count(&self) -> usize {
        self.registry.count()
    }

    /// Look up a live session
    pub fn connected_client(&self, id: &ClientId) -> Option<Arc<ConnectedClient>> {
        self.registry.get(id)
    }

    /// Session registry shared with the acceptors
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Subscribe to acceptor, session and handler changes
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    fn publish(&self, reason: ChangeReason, subject: Subject) {
        let _ = self.events.send(HostEvent::new(reason, subject));
    }
}
