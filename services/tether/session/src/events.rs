//! State-change notifications published by a host.
//!
//! Interested collaborators call [`crate::Host::subscribe`] and receive a
//! [`HostEvent`] for every acceptor, session and handler that comes or goes.

use std::fmt;

use crate::ids::{ClientId, HandlerId};

/// Why a notification was published
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeReason {
    /// A listening endpoint was registered
    AcceptorAdded,
    /// A listening endpoint was removed
    AcceptorRemoved,
    /// The host started accepting
    HostOpened,
    /// The host stopped accepting and released its sessions
    HostClosed,
    /// A new session was created
    ClientAdded,
    /// A session lost its last handler
    ClientRemoved,
    /// A channel joined a session
    HandlerAdded,
    /// A channel left a session
    HandlerRemoved,
}

/// What the notification is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subject {
    /// The host as a whole
    Host,
    /// An acceptor, by port
    Port(u16),
    /// A session
    Client(ClientId),
    /// A handler
    Handler(HandlerId),
}

/// One state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostEvent {
    /// What happened
    pub reason: ChangeReason,
    /// Which entity it happened to
    pub subject: Subject,
}

impl HostEvent {
    pub(crate) fn new(reason: ChangeReason, subject: Subject) -> Self {
        Self { reason, subject }
    }
}

impl fmt::Display for HostEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.subject {
            Subject::Host => write!(f, "{:?}", self.reason),
            Subject::Port(port) => write!(f, "{:?} port {}", self.reason, port),
            Subject::Client(id) => write!(f, "{:?} client {}", self.reason, id),
            Subject::Handler(id) => write!(f, "{:?} handler {}", self.reason, id),
        }
    }
}
