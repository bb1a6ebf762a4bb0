//! Listening endpoints and the acceptor side of the handshake.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tether_wire::ErrorCode;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::Channel;
use crate::config::SessionConfig;
use crate::error::{HandshakeStage, Result};
use crate::handler::{Handler, HandlerFactory, StopMode};
use crate::handshake::{self, encode_session_ids, HandshakeOutcome, HandshakeRequest};
use crate::ids::HandlerId;
use crate::registry::{ClientRegistry, ConnectedClient};
use crate::transport::{listen_tcp, KeepAlive};

/// One listening port and the factory for the handlers it starts
pub(crate) struct Acceptor {
    port: u16,
    factory: Arc<dyn HandlerFactory>,
    running: Option<Running>,
}

struct Running {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// What every accepted socket needs
struct Shared {
    config: Arc<SessionConfig>,
    registry: Arc<ClientRegistry>,
    factory: Arc<dyn HandlerFactory>,
}

impl Acceptor {
    pub(crate) fn new(port: u16, factory: Arc<dyn HandlerFactory>) -> Self {
        Self {
            port,
            factory,
            running: None,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Bind the port and spawn the accept loop
    pub(crate) fn start(&mut self, config: &Arc<SessionConfig>, registry: &Arc<ClientRegistry>) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }
        let addr = SocketAddr::new(config.listen_address, self.port);
        let listener = listen_tcp(addr, config.listen_backlog)?;
        info!("Accepting {} connections on {}", self.factory.name(), addr);

        let shared = Arc::new(Shared {
            config: config.clone(),
            registry: registry.clone(),
            factory: self.factory.clone(),
        });
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(accept_loop(listener, shared, shutdown.clone()));
        self.running = Some(Running { shutdown, task });
        Ok(())
    }

    /// Stop accepting; sessions already established are left alone
    pub(crate) async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.shutdown.cancel();
            if let Err(e) = running.task.await {
                warn!("Accept loop on port {} ended abnormally: {}", self.port, e);
            }
            debug!("Stopped accepting on port {}", self.port);
        }
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, shutdown: CancellationToken) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            },
        };
        debug!("Accepted connection from {}", peer);

        let shared = shared.clone();
        tokio::spawn(async move {
            if let Err(e) = preprocess(stream, peer, &shared).await {
                error!("Handshake with {} failed: {}", peer, e);
            }
        });
    }
}

/// Run the acceptor side of the handshake on a fresh socket
async fn preprocess(mut stream: TcpStream, peer: SocketAddr, shared: &Shared) -> Result<()> {
    let keep_alive = shared.config.keep_alive;
    if let Err(e) = stream.set_keep_alive(
        keep_alive.enabled,
        millis(keep_alive.time),
        millis(keep_alive.interval),
    ) {
        warn!("Could not set keep-alive for {}: {}", peer, e);
    }

    let frame = handshake::read_frame(&mut stream).await?;
    match HandshakeRequest::from_frame(&frame)? {
        HandshakeRequest::NewSession => {
            let client = shared.registry.create_client();
            let started = start_handler(stream, &client, shared, HandshakeStage::NewSession).await;
            if started.is_err() && client.handler_count() == 0 {
                client.retire();
            }
            started
        }
        HandshakeRequest::AdditionalChannel { client_id } => {
            match shared.registry.get(&client_id) {
                Some(client) => {
                    start_handler(stream, &client, shared, HandshakeStage::AdditionalChannel).await
                }
                None => {
                    warn!("{} asked for a channel of unknown client {}", peer, client_id);
                    deny(stream, ErrorCode::ClientNotFound).await
                }
            }
        }
        HandshakeRequest::Recovery {
            client_id,
            handler_id,
        } => {
            let Some(client) = shared.registry.get(&client_id) else {
                warn!("{} tried to recover unknown client {}", peer, client_id);
                return deny(stream, ErrorCode::ClientNotFound).await;
            };
            // The waiting channel sends the ACCEPT itself
            match client.broker().resolve(handler_id, stream) {
                Ok(()) => {
                    info!("Handed reconnect from {} to handler {}", peer, handler_id);
                    Ok(())
                }
                Err(stream) => {
                    warn!("{} tried to recover handler {} with no pending waiter", peer, handler_id);
                    deny(stream, ErrorCode::HandlerNotFound).await
                }
            }
        }
        HandshakeRequest::Unknown { command } => {
            warn!("{} opened with unknown command {:?}", peer, command);
            deny(stream, ErrorCode::UnknownCode).await
        }
    }
}

/// Mint a handler for `client`, answer `ACCEPT`, and start serving
async fn start_handler(
    stream: TcpStream,
    client: &Arc<ConnectedClient>,
    shared: &Shared,
    stage: HandshakeStage,
) -> Result<()> {
    let handler_id = HandlerId::new();
    let channel = Channel::accepted(stream, shared.config.clone())?;
    let name = shared.factory.name();
    let handler = Handler::new(handler_id, client, name, channel.clone(), shared.factory.create());
    if client.register_handler(handler.clone()).is_err() {
        // The session lost its last handler after the lookup
        let denied = channel
            .send_frame(&HandshakeOutcome::deny(ErrorCode::ClientNotFound).to_frame()?)
            .await;
        channel.close().await;
        return denied;
    }

    let payload = match stage {
        HandshakeStage::NewSession => encode_session_ids(client.id(), handler_id),
        _ => Bytes::copy_from_slice(handler_id.as_bytes()),
    };
    let accepted = async {
        channel
            .send_frame(&HandshakeOutcome::Accepted(Some(payload)).to_frame()?)
            .await?;
        channel.initialize_on_server(client.id(), handler_id, name, client.broker())
    }
    .await;

    match accepted {
        Ok(()) => {
            handler.start();
            Ok(())
        }
        Err(e) => {
            handler.stop(StopMode::Hard).await;
            Err(e)
        }
    }
}

async fn deny(mut stream: TcpStream, code: ErrorCode) -> Result<()> {
    handshake::write_frame(&mut stream, &HandshakeOutcome::deny(code).to_frame()?).await
}

fn millis(duration: std::time::Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}
