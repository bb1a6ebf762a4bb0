//! Initiator-side session.
//!
//! A [`RemoteClient`] holds the primary channel opened with `NEW_CLIENT` and
//! a pool of additional channels opened with `NOT_NEW_CLIENT`.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::config::SessionConfig;
use crate::error::Result;
use crate::handler::{HandlerStopRequest, StopMode};
use crate::handshake;
use crate::ids::ClientId;
use crate::listener::ClientListener;
use crate::pool::{ChannelFactory, ConnectionPool};

/// Opens pooled channels on the primary channel's host, at the requested port
struct AdditionalChannelFactory {
    host: SocketAddr,
    client_id: ClientId,
    config: Arc<SessionConfig>,
}

#[async_trait]
impl ChannelFactory<u16> for AdditionalChannelFactory {
    async fn create(&self, port: &u16) -> Result<Arc<Channel>> {
        let endpoint = SocketAddr::new(self.host.ip(), *port);
        handshake::open_additional_channel(endpoint, self.client_id, self.config.clone()).await
    }
}

/// Client end of a session
pub struct RemoteClient {
    primary: Arc<Channel>,
    client_id: ClientId,
    pool: ConnectionPool<u16>,
    listener: ClientListener,
}

impl RemoteClient {
    /// Open a session with the host at `addr`
    pub async fn connect(addr: SocketAddr, config: Arc<SessionConfig>) -> Result<Self> {
        let primary = handshake::open_session(addr, config.clone()).await?;
        let client_id = primary.client_id()?;
        let factory = Arc::new(AdditionalChannelFactory {
            host: addr,
            client_id,
            config,
        });
        info!("{}: connected", primary.context());
        Ok(Self {
            listener: ClientListener::new(primary.clone()),
            primary,
            client_id,
            pool: ConnectionPool::new(factory),
        })
    }

    /// Session id assigned by the host
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Channel opened by `NEW_CLIENT`
    pub fn primary(&self) -> &Arc<Channel> {
        &self.primary
    }

    /// Notification routing for the primary channel; idle until started
    pub fn listener(&self) -> &ClientListener {
        &self.listener
    }

    /// Borrow a channel to `port` on the same host, opening one if none is idle
    pub async fn take_connection(&self, port: u16) -> Result<Arc<Channel>> {
        self.pool.take(&port).await
    }

    /// Return a borrowed channel to the pool
    pub fn release_connection(&self, channel: Arc<Channel>) -> Result<()> {
        self.pool.release(channel)
    }

    /// Pooled channels currently idle
    pub fn idle_connections(&self) -> usize {
        self.pool.idle_count()
    }

    /// Ask the host to stop the handler behind `channel`, then close it.
    ///
    /// A soft stop travels on the channel itself. A hard stop travels on the
    /// primary channel inside an exclusive exchange, so it is not queued
    /// behind the target's own traffic.
    pub async fn disconnect_from_handler(&self, channel: &Channel, mode: StopMode) -> Result<()> {
        let request = HandlerStopRequest {
            handler_id: channel.handler_id()?,
            mode,
        };
        let frame = request.to_frame()?;
        let sent = match mode {
            StopMode::Soft => channel.send_frame(&frame).await,
            StopMode::Hard => self.primary.exclusive().await.send_frame(&frame).await,
        };
        channel.close().await;
        debug!("{}: disconnected ({:?})", channel.context(), mode);
        sent
    }

    /// Stop listening, then soft-stop every idle pooled channel and the
    /// primary channel
    pub async fn disconnect(&self) -> Result<()> {
        self.listener.stop();
        for channel in self.pool.drain() {
            if let Err(e) = self.disconnect_from_handler(&channel, StopMode::Soft).await {
                warn!("{}: stop request failed: {}", channel.context(), e);
            }
        }
        self.disconnect_from_handler(&self.primary, StopMode::Soft).await?;
        info!("Client {} disconnected", self.client_id);
        Ok(())
    }
}
