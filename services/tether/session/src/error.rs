//! Session error types and their failure taxonomy.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tether_wire::{ErrorCode, WireError};
use thiserror::Error;

use crate::ids::{ClientId, HandlerId};

/// Result type used throughout the session crate
pub type Result<T> = std::result::Result<T, SessionError>;

/// Broad category of a failure, used to decide whether recovery applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Reset, aborted or timed-out socket; recovered by reconnect-and-retry
    TransientTransport,
    /// Peer closed, non-transient socket error, or recovery exhausted
    FatalTransport,
    /// Checksum mismatch or malformed fixed-size payload
    Integrity,
    /// `DENY` response or unexpected handshake command
    Protocol,
    /// Misuse of the API, such as a duplicate release or double initialization
    Contract,
    /// The channel was closed locally
    Shutdown,
}

/// Handshake flow a failure belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeStage {
    /// `NEW_CLIENT`
    NewSession,
    /// `NOT_NEW_CLIENT`
    AdditionalChannel,
    /// `RECONNECT`
    Recovery,
}

impl fmt::Display for HandshakeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeStage::NewSession => "new session",
            HandshakeStage::AdditionalChannel => "additional channel",
            HandshakeStage::Recovery => "recovery",
        };
        f.write_str(name)
    }
}

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// Opening a socket failed
    #[error("connect to {addr} failed: {source}")]
    Connect {
        /// Endpoint that refused or failed
        addr: SocketAddr,
        /// Underlying socket error
        #[source]
        source: io::Error,
    },

    /// Socket error
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A receive completed with zero bytes
    #[error("connection lost: peer closed the channel")]
    PeerClosed,

    /// The channel was closed locally
    #[error("channel closed")]
    Closed,

    /// Every transfer attempt hit a transient failure
    #[error("transfer failed after {attempts} attempts: {last}")]
    TransferAttemptsExhausted {
        /// Attempts made
        attempts: u32,
        /// Failure of the final attempt
        last: Box<SessionError>,
    },

    /// Every reconnect attempt failed transiently
    #[error("reconnect failed after {attempts} attempts: {last}")]
    ReconnectAttemptsExhausted {
        /// Attempts made
        attempts: u32,
        /// Failure of the final attempt
        last: Box<SessionError>,
    },

    /// The initiator did not come back in time
    #[error("no replacement connection within {0:?}")]
    ReconnectTimedOut(Duration),

    /// An earlier probe or recovery failure left the channel unusable
    #[error("channel unusable: {reason}")]
    Unusable {
        /// Category of the original failure
        kind: FailureKind,
        /// Description of the original failure
        reason: String,
    },

    /// Frame encoding, decoding or verification failed
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The acceptor answered `DENY`
    #[error("{stage} denied with error code {code}")]
    Denied {
        /// Flow that was refused
        stage: HandshakeStage,
        /// Raw error code from the response
        code: i16,
    },

    /// The peer answered with something other than `ACCEPT` or `DENY`
    #[error("unexpected response {command:?} during {stage}")]
    UnexpectedResponse {
        /// Flow in progress
        stage: HandshakeStage,
        /// Command code received
        command: Option<i16>,
    },

    /// An identity payload had the wrong size
    #[error("malformed identity payload: expected {expected} bytes, got {actual}")]
    MalformedIdentity {
        /// Required size
        expected: usize,
        /// Size received
        actual: usize,
    },

    /// The channel identity was already bound
    #[error("channel already initialized")]
    AlreadyInitialized,

    /// The channel identity was rejected
    #[error("invalid channel identity: {0}")]
    InvalidIdentity(&'static str),

    /// The operation needs a bound channel identity
    #[error("channel is not initialized")]
    NotInitialized,

    /// The channel is already in the idle pool
    #[error("handler {0} was released twice")]
    DuplicateRelease(HandlerId),

    /// A reconnect waiter already exists for the handler
    #[error("a reconnect waiter for handler {0} is already registered")]
    DuplicateWaiter(HandlerId),

    /// No handler with this id in the session
    #[error("handler {0} not found")]
    HandlerNotFound(HandlerId),

    /// No session with this id
    #[error("client {0} not found")]
    ClientNotFound(ClientId),

    /// An acceptor already listens on the port
    #[error("acceptor for port {0} already exists")]
    DuplicateAcceptor(u16),

    /// No acceptor listens on the port
    #[error("acceptor for port {0} not found")]
    AcceptorNotFound(u16),

    /// No notification callback for this handler and command
    #[error("no notification callback for handler {handler_id} command {command}")]
    CallbackNotFound {
        /// Handler the notifications come from
        handler_id: HandlerId,
        /// Command code of the notification
        command: i16,
    },
}

impl SessionError {
    /// Convert a socket error, treating end-of-stream as a closed peer
    pub fn from_io(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            SessionError::PeerClosed
        } else {
            SessionError::Io(err)
        }
    }

    /// Failure category
    pub fn kind(&self) -> FailureKind {
        match self {
            SessionError::Io(err) if is_transient_io(err) => FailureKind::TransientTransport,
            SessionError::Io(_)
            | SessionError::Connect { .. }
            | SessionError::PeerClosed
            | SessionError::TransferAttemptsExhausted { .. }
            | SessionError::ReconnectAttemptsExhausted { .. }
            | SessionError::ReconnectTimedOut(_) => FailureKind::FatalTransport,
            SessionError::Unusable { kind, .. } => match kind {
                FailureKind::TransientTransport => FailureKind::FatalTransport,
                other => *other,
            },
            SessionError::Closed => FailureKind::Shutdown,
            SessionError::Wire(err) => match err {
                WireError::NonPositiveCode { .. }
                | WireError::EmptyPayload
                | WireError::PayloadTooLarge(_) => FailureKind::Contract,
                WireError::UnknownErrorCode(_) => FailureKind::Protocol,
                _ => FailureKind::Integrity,
            },
            SessionError::MalformedIdentity { .. } => FailureKind::Integrity,
            SessionError::Denied { .. } | SessionError::UnexpectedResponse { .. } => {
                FailureKind::Protocol
            }
            SessionError::AlreadyInitialized
            | SessionError::InvalidIdentity(_)
            | SessionError::NotInitialized
            | SessionError::DuplicateRelease(_)
            | SessionError::DuplicateWaiter(_)
            | SessionError::HandlerNotFound(_)
            | SessionError::ClientNotFound(_)
            | SessionError::DuplicateAcceptor(_)
            | SessionError::AcceptorNotFound(_)
            | SessionError::CallbackNotFound { .. } => FailureKind::Contract,
        }
    }

    /// Whether reconnect-and-retry applies
    pub fn is_transient(&self) -> bool {
        self.kind() == FailureKind::TransientTransport
    }

    /// Error code carried by a `DENY`, when it is one the protocol knows
    pub fn denied_code(&self) -> Option<ErrorCode> {
        match self {
            SessionError::Denied { code, .. } => ErrorCode::try_from(*code).ok(),
            _ => None,
        }
    }

    /// Whether the initiator's reconnect loop should try again after this error
    pub(crate) fn retry_reconnect(&self) -> bool {
        match self {
            SessionError::Connect { source, .. } => is_transient_io(source),
            other => other.is_transient(),
        }
    }
}

/// Reset, aborted and timed-out sockets are worth reconnecting
pub(crate) fn is_transient_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::TimedOut,
        ] {
            assert!(SessionError::from_io(io::Error::from(kind)).is_transient());
        }

        let refused = SessionError::from_io(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert_eq!(refused.kind(), FailureKind::FatalTransport);
    }

    #[test]
    fn test_eof_is_peer_closed() {
        let err = SessionError::from_io(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(matches!(err, SessionError::PeerClosed));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_kinds() {
        assert_eq!(
            SessionError::Wire(WireError::ChecksumMismatch { len: 4 }).kind(),
            FailureKind::Integrity
        );
        assert_eq!(
            SessionError::Denied {
                stage: HandshakeStage::Recovery,
                code: 3
            }
            .kind(),
            FailureKind::Protocol
        );
        assert_eq!(
            SessionError::DuplicateRelease(HandlerId::new()).kind(),
            FailureKind::Contract
        );
        assert_eq!(SessionError::Closed.kind(), FailureKind::Shutdown);
    }

    #[test]
    fn test_denied_code() {
        let err = SessionError::Denied {
            stage: HandshakeStage::AdditionalChannel,
            code: 2,
        };
        assert_eq!(err.denied_code(), Some(ErrorCode::ClientNotFound));
    }

    #[test]
    fn test_reconnect_retry_uses_connect_source() {
        let timed_out = SessionError::Connect {
            addr: "127.0.0.1:1".parse().unwrap(),
            source: io::Error::from(io::ErrorKind::TimedOut),
        };
        assert!(timed_out.retry_reconnect());
        assert!(!timed_out.is_transient());

        let refused = SessionError::Connect {
            addr: "127.0.0.1:1".parse().unwrap(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert!(!refused.retry_reconnect());
    }
}
