//! TCP channels, liveness probing, reconnection, handshake, pooling and
//! handler lifecycle for tether.
//!
//! A client opens a session against a [`Host`] with `NEW_CLIENT` and may add
//! channels to it with `NOT_NEW_CLIENT`. Every channel is served on the host
//! by its own [`Handler`]. Broken sockets are repaired underneath the
//! channel: the initiator reconnects with `RECONNECT` and the acceptor waits
//! for it through the session's [`ReconnectBroker`].
//!
//! ## Features
//!
//! - **Transport Channel**: exact-size sends and receives with bounded retry
//! - **Liveness Guard**: periodic probes and an exclusive-access gate
//! - **Handshake**: new session, additional channel and recovery flows
//! - **Connection Pool**: idle channel reuse keyed by remote port
//! - **Handler Lifecycle**: soft and hard stop with single-shot cleanup
//! - **Client Listener**: host-pushed notifications on the primary channel
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tether_session::{RemoteClient, SessionConfig, StopMode};
//! use tether_wire::Frame;
//!
//! # async fn example() -> tether_session::Result<()> {
//! let config = Arc::new(SessionConfig::default());
//! let client = RemoteClient::connect("127.0.0.1:7000".parse().unwrap(), config).await?;
//!
//! let channel = client.take_connection(7001).await?;
//! channel.send_frame(&Frame::with_payload(100, b"ping".to_vec())?).await?;
//! let reply = channel.receive_frame().await?;
//! println!("reply: {:?}", reply.payload());
//!
//! client.disconnect_from_handler(&channel, StopMode::Soft).await?;
//! client.disconnect().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod acceptor;
pub mod broker;
pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod guard;
pub mod handler;
pub mod handshake;
pub mod host;
pub mod ids;
pub mod listener;
pub mod pool;
pub mod registry;
pub mod transport;

// Re-export main types
pub use broker::{ReconnectBroker, WaitOutcome};
pub use channel::{Channel, ChannelIdentity, ExclusiveExchange, LogContext, Role};
pub use client::RemoteClient;
pub use config::{KeepAliveSettings, SessionConfig};
pub use error::{FailureKind, HandshakeStage, Result, SessionError};
pub use events::{ChangeReason, HostEvent, Subject};
pub use guard::{ExclusiveGate, GateGuard};
pub use handler::{
    CommandHandler, Handler, HandlerContext, HandlerFactory, HandlerState, HandlerStopRequest,
    StopMode,
};
pub use handshake::{open_additional_channel, open_session, HandshakeOutcome, HandshakeRequest};
pub use host::Host;
pub use ids::{ClientId, HandlerId};
pub use listener::{ClientListener, Notification, NotificationCallback};
pub use pool::{ChannelFactory, ConnectionPool, MatchPolicy, RemotePortPolicy};
pub use registry::{ClientRegistry, ConnectedClient};
pub use transport::{connect_tcp, listen_tcp, KeepAlive};
