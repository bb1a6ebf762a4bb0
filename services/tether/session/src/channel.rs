//! Transport channel.
//!
//! A [`Channel`] owns one TCP socket to its peer and moves exact byte counts
//! over it. Once a channel identity is bound, socket failures classified as
//! transient are recovered by reconnecting (initiator) or by waiting for the
//! initiator to come back (acceptor), after which the failed send or receive
//! is restarted from its first byte.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tether_wire::{Frame, FrameHeader, WireError, HEADER_SIZE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{ReconnectBroker, WaitOutcome};
use crate::config::SessionConfig;
use crate::error::{HandshakeStage, Result, SessionError};
use crate::guard::{self, Direction, ExclusiveGate, GateGuard, Liveness};
use crate::handshake::{self, HandshakeOutcome, HandshakeRequest};
use crate::ids::{ClientId, HandlerId};
use crate::transport::connect_tcp;

/// Pause between peeks while a probe header is only partly buffered
const PEEK_RETRY: Duration = Duration::from_millis(5);

/// Which end of the connection a channel is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opened the connection (client side)
    Initiator,
    /// Accepted the connection (server side)
    Acceptor,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("client"),
            Role::Acceptor => f.write_str("server"),
        }
    }
}

/// Identity bound to a channel by the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelIdentity {
    /// Session the channel belongs to
    pub client_id: ClientId,
    /// The channel's own id
    pub handler_id: HandlerId,
    /// Name of the serving handler (acceptor side only)
    pub handler_name: Option<String>,
}

impl ChannelIdentity {
    fn new(client_id: ClientId, handler_id: HandlerId, handler_name: Option<String>) -> Result<Self> {
        if client_id.is_nil() {
            return Err(SessionError::InvalidIdentity("nil client id"));
        }
        if handler_id.is_nil() {
            return Err(SessionError::InvalidIdentity("nil handler id"));
        }
        if handler_name.as_deref() == Some("") {
            return Err(SessionError::InvalidIdentity("empty handler name"));
        }
        Ok(Self {
            client_id,
            handler_id,
            handler_name,
        })
    }
}

enum Binding {
    Initiator(ChannelIdentity),
    Acceptor {
        identity: ChannelIdentity,
        broker: Arc<ReconnectBroker<TcpStream>>,
    },
}

impl Binding {
    fn identity(&self) -> &ChannelIdentity {
        match self {
            Binding::Initiator(identity) => identity,
            Binding::Acceptor { identity, .. } => identity,
        }
    }
}

/// Current socket generation; `abort` fires when the socket is retired
struct Link {
    generation: u64,
    abort: CancellationToken,
}

/// Logging context of a channel
pub struct LogContext<'a> {
    role: Role,
    remote: SocketAddr,
    identity: Option<&'a ChannelIdentity>,
}

impl fmt::Display for LogContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.identity {
            Some(identity) => {
                write!(
                    f,
                    "[{} {} client={} handler={}",
                    self.role, self.remote, identity.client_id, identity.handler_id
                )?;
                if let Some(name) = &identity.handler_name {
                    write!(f, " name={}", name)?;
                }
                f.write_str("]")
            }
            None => write!(f, "[{} {} unbound]", self.role, self.remote),
        }
    }
}

/// One TCP connection carrying framed messages for a single handler.
///
/// At most one send and one receive may be outstanding at a time; callers
/// serialize their own traffic.
pub struct Channel {
    role: Role,
    remote: SocketAddr,
    config: Arc<SessionConfig>,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    link: Mutex<Link>,
    recovery: Mutex<()>,
    connected: AtomicBool,
    transfers: AtomicUsize,
    receiving: AtomicUsize,
    binding: OnceLock<Binding>,
    liveness: Liveness,
    gate: ExclusiveGate,
    closed: CancellationToken,
}

impl Channel {
    /// Connect to `endpoint` as the initiator.
    ///
    /// Fails with [`SessionError::Connect`] without retrying; recovery only
    /// applies to channels whose identity has been bound.
    pub async fn open(endpoint: SocketAddr, config: Arc<SessionConfig>) -> Result<Arc<Self>> {
        let stream = connect_tcp(endpoint)
            .await
            .map_err(|source| SessionError::Connect {
                addr: endpoint,
                source,
            })?;
        debug!("Opened channel to {}", endpoint);
        Ok(Arc::new(Self::from_stream(Role::Initiator, endpoint, stream, config)))
    }

    /// Wrap a socket accepted by an acceptor
    pub fn accepted(stream: TcpStream, config: Arc<SessionConfig>) -> Result<Arc<Self>> {
        let remote = stream.peer_addr()?;
        Ok(Arc::new(Self::from_stream(Role::Acceptor, remote, stream, config)))
    }

    fn from_stream(role: Role, remote: SocketAddr, stream: TcpStream, config: Arc<SessionConfig>) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            role,
            remote,
            config,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            link: Mutex::new(Link {
                generation: 0,
                abort: CancellationToken::new(),
            }),
            recovery: Mutex::new(()),
            connected: AtomicBool::new(true),
            transfers: AtomicUsize::new(0),
            receiving: AtomicUsize::new(0),
            binding: OnceLock::new(),
            liveness: Liveness::new(role),
            gate: ExclusiveGate::default(),
            closed: CancellationToken::new(),
        }
    }

    /// Bind the identity received in an `ACCEPT` on the initiator side
    pub fn initialize_on_client(self: &Arc<Self>, client_id: ClientId, handler_id: HandlerId) -> Result<()> {
        if self.role != Role::Initiator {
            return Err(SessionError::InvalidIdentity("acceptor channel bound as client"));
        }
        let identity = ChannelIdentity::new(client_id, handler_id, None)?;
        self.bind(Binding::Initiator(identity))
    }

    /// Bind the identity minted for an accepted channel.
    ///
    /// `broker` is the session's reconnect broker, used to wait for the
    /// initiator when the socket breaks.
    pub fn initialize_on_server(
        self: &Arc<Self>,
        client_id: ClientId,
        handler_id: HandlerId,
        handler_name: &str,
        broker: Arc<ReconnectBroker<TcpStream>>,
    ) -> Result<()> {
        if self.role != Role::Acceptor {
            return Err(SessionError::InvalidIdentity("initiator channel bound as server"));
        }
        let identity = ChannelIdentity::new(client_id, handler_id, Some(handler_name.to_string()))?;
        self.bind(Binding::Acceptor { identity, broker })
    }

    fn bind(self: &Arc<Self>, binding: Binding) -> Result<()> {
        self.binding
            .set(binding)
            .map_err(|_| SessionError::AlreadyInitialized)?;
        guard::spawn_probe(self);
        debug!("{}: channel initialized", self.context());
        Ok(())
    }

    /// Bound identity, if the handshake has completed
    pub fn identity(&self) -> Option<&ChannelIdentity> {
        self.binding.get().map(Binding::identity)
    }

    /// Bound handler id
    pub fn handler_id(&self) -> Result<HandlerId> {
        self.identity()
            .map(|identity| identity.handler_id)
            .ok_or(SessionError::NotInitialized)
    }

    /// Bound session id
    pub fn client_id(&self) -> Result<ClientId> {
        self.identity()
            .map(|identity| identity.client_id)
            .ok_or(SessionError::NotInitialized)
    }

    /// Which end of the connection this is
    pub fn role(&self) -> Role {
        self.role
    }

    /// Peer endpoint
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Whether the socket is believed usable
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Whether a send or receive is in progress
    pub fn is_transfer_active(&self) -> bool {
        self.transfers.load(Ordering::Acquire) > 0
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Logging context for this channel
    pub fn context(&self) -> LogContext<'_> {
        LogContext {
            role: self.role,
            remote: self.remote,
            identity: self.identity(),
        }
    }

    pub(crate) fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(crate) fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Send exactly `buf.len()` bytes
    pub async fn send(&self, buf: &[u8]) -> Result<()> {
        self.transfer(Some(Direction::Send), || self.write_once(buf))
            .await
    }

    /// Receive exactly `size` bytes
    pub async fn receive(&self, size: usize) -> Result<Bytes> {
        self.transfer(Some(Direction::Receive), || self.read_once(size))
            .await
    }

    /// Send one frame as a single write
    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let _shared = self.gate.shared().await;
        self.write_frame(frame).await
    }

    /// Receive one frame, verifying its checksum.
    ///
    /// Probe headers that arrive ahead of the frame are skipped. A header
    /// announcing more than `max_payload_size` bytes leaves the channel
    /// unusable.
    pub async fn receive_frame(&self) -> Result<Frame> {
        let _receiving = ActiveTransfer::enter(&self.receiving);
        loop {
            let mut head = self.receive(HEADER_SIZE).await?;
            let header = FrameHeader::decode(&mut head)?;
            if header.check_connection {
                debug!("{}: skipped probe frame", self.context());
                continue;
            }
            let payload = match header.payload_size()? {
                None => None,
                Some(len) if len > self.config.max_payload_size => {
                    return Err(self.fail(WireError::PayloadTooLarge(len).into()).await);
                }
                Some(len) => Some(self.receive(len).await?),
            };
            return Frame::from_parts(header, payload).map_err(|e| {
                error!("{}: rejected frame: {}", self.context(), e);
                SessionError::from(e)
            });
        }
    }

    /// Take the channel's exclusive gate for an out-of-band exchange
    pub async fn exclusive(&self) -> ExclusiveExchange<'_> {
        ExclusiveExchange {
            channel: self,
            _guard: self.gate.enter().await,
        }
    }

    /// Close the socket.
    ///
    /// Blocked sends and receives, as well as any recovery in progress, end
    /// with [`SessionError::Closed`].
    pub async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        self.connected.store(false, Ordering::Release);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.reader.lock().await.take();
        debug!("{}: channel closed", self.context());
    }

    async fn write_frame(&self, frame: &Frame) -> Result<()> {
        self.send(&frame.encode()).await
    }

    async fn write_once(&self, buf: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or_else(link_retired)?;
        writer.write_all(buf).await
    }

    async fn read_once(&self, size: usize) -> io::Result<Bytes> {
        let mut buf = BytesMut::zeroed(size);
        if size > 0 {
            let mut reader = self.reader.lock().await;
            let reader = reader.as_mut().ok_or_else(link_retired)?;
            reader.read_exact(&mut buf).await?;
        }
        Ok(buf.freeze())
    }

    /// Consume a probe header waiting at the front of the stream.
    ///
    /// The reader stays locked from the peek to the consume, and nothing is
    /// touched while a frame receive is under way, so the peek always lands
    /// on a frame boundary.
    async fn take_probe_header(&self) -> io::Result<bool> {
        let mut reader = self.reader.lock().await;
        if self.receiving.load(Ordering::Acquire) > 0 {
            return Ok(false);
        }
        let reader = reader.as_mut().ok_or_else(link_retired)?;
        let mut buf = [0u8; HEADER_SIZE];
        loop {
            let n = reader.peek(&mut buf).await?;
            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            if n >= HEADER_SIZE {
                break;
            }
            tokio::time::sleep(PEEK_RETRY).await;
        }
        let header = FrameHeader::decode(&mut &buf[..])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if header.check_connection {
            reader.read_exact(&mut buf).await?;
        }
        Ok(header.check_connection)
    }

    /// Run one liveness probe in this channel's role
    pub(crate) async fn probe(&self) -> Result<()> {
        self.liveness.begin_probe();
        let result = match self.role {
            Role::Initiator => {
                let probe = FrameHeader::probe().to_bytes();
                self.transfer(None, || self.write_once(&probe)).await
            }
            Role::Acceptor => self
                .transfer(None, || self.take_probe_header())
                .await
                .map(|_| ()),
        };
        if let Err(e) = &result {
            if !matches!(e, SessionError::Closed) {
                self.liveness.record_failure(e).await;
            }
        }
        self.liveness.end_probe();
        result
    }

    /// Run `op` until it succeeds, recovering transient failures in between.
    ///
    /// `direction` is `None` for the probe's own I/O, which must not wait on
    /// itself.
    async fn transfer<T, F, Fut>(&self, direction: Option<Direction>, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = io::Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            if let Some(direction) = direction {
                self.liveness.wait_ready(direction).await?;
            }
            let (generation, abort) = {
                let link = self.link.lock().await;
                (link.generation, link.abort.clone())
            };

            let outcome = {
                let _active = ActiveTransfer::enter(&self.transfers);
                tokio::select! {
                    biased;
                    _ = self.closed.cancelled() => return Err(SessionError::Closed),
                    _ = abort.cancelled() => Err(link_retired()),
                    result = op() => result,
                }
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    self.recover(err, generation, attempt).await?;
                }
            }
        }
    }

    async fn recover(&self, err: io::Error, generation: u64, attempt: u32) -> Result<()> {
        let err = SessionError::from_io(err);
        if self.closed.is_cancelled() {
            return Err(SessionError::Closed);
        }
        let Some(binding) = self.binding.get() else {
            self.connected.store(false, Ordering::Release);
            warn!("{}: transfer failed before initialization: {}", self.context(), err);
            return Err(err);
        };
        if !err.is_transient() {
            return Err(self.fail(err).await);
        }
        if attempt >= self.config.max_transfer_attempts {
            let exhausted = SessionError::TransferAttemptsExhausted {
                attempts: attempt,
                last: Box::new(err),
            };
            return Err(self.fail(exhausted).await);
        }

        warn!(
            "{}: transient failure on attempt {}/{}: {}",
            self.context(),
            attempt,
            self.config.max_transfer_attempts,
            err
        );
        self.connected.store(false, Ordering::Release);
        match self.reconnect(binding, generation).await {
            Ok(()) => Ok(()),
            Err(SessionError::Closed) => Err(SessionError::Closed),
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Mark the channel unusable and log why
    async fn fail(&self, err: SessionError) -> SessionError {
        self.connected.store(false, Ordering::Release);
        self.liveness.record_failure(&err).await;
        error!("{}: channel failed: {}", self.context(), err);
        err
    }

    /// Replace the broken socket, unless another caller already did
    async fn reconnect(&self, binding: &Binding, failed_generation: u64) -> Result<()> {
        let _recovery = self.recovery.lock().await;
        self.liveness.check().await?;
        if self.link.lock().await.generation != failed_generation {
            return Ok(());
        }

        self.retire_link().await;
        let stream = match binding {
            Binding::Initiator(identity) => self.reconnect_as_initiator(identity).await?,
            Binding::Acceptor { identity, broker } => {
                self.reconnect_as_acceptor(identity, broker).await?
            }
        };
        self.install(stream).await;
        info!("{}: connection restored", self.context());
        Ok(())
    }

    async fn retire_link(&self) {
        self.link.lock().await.abort.cancel();
        self.writer.lock().await.take();
        self.reader.lock().await.take();
    }

    async fn install(&self, stream: TcpStream) {
        let (reader, writer) = stream.into_split();
        *self.reader.lock().await = Some(reader);
        *self.writer.lock().await = Some(writer);
        let mut link = self.link.lock().await;
        link.generation += 1;
        link.abort = CancellationToken::new();
        self.connected.store(true, Ordering::Release);
    }

    async fn reconnect_as_initiator(&self, identity: &ChannelIdentity) -> Result<TcpStream> {
        let max_attempts = self.config.max_reconnect_attempts;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            tokio::select! {
                _ = self.closed.cancelled() => return Err(SessionError::Closed),
                _ = tokio::time::sleep(self.config.reconnect_backoff) => {}
            }
            debug!(
                "{}: reconnect attempt {}/{}",
                self.context(),
                attempt,
                max_attempts
            );

            let err = match self.recovery_handshake(identity).await {
                Ok(stream) => return Ok(stream),
                Err(err) => err,
            };
            if !err.retry_reconnect() {
                return Err(err);
            }
            if attempt >= max_attempts {
                return Err(SessionError::ReconnectAttemptsExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }
            warn!("{}: reconnect attempt {} failed: {}", self.context(), attempt, err);
        }
    }

    async fn recovery_handshake(&self, identity: &ChannelIdentity) -> Result<TcpStream> {
        let mut stream = connect_tcp(self.remote)
            .await
            .map_err(|source| SessionError::Connect {
                addr: self.remote,
                source,
            })?;
        let request = HandshakeRequest::Recovery {
            client_id: identity.client_id,
            handler_id: identity.handler_id,
        };
        handshake::write_frame(&mut stream, &request.to_frame()?).await?;
        let response = handshake::read_frame(&mut stream).await?;
        HandshakeOutcome::from_frame(response, HandshakeStage::Recovery)?
            .accepted(HandshakeStage::Recovery)?;
        Ok(stream)
    }

    async fn reconnect_as_acceptor(
        &self,
        identity: &ChannelIdentity,
        broker: &ReconnectBroker<TcpStream>,
    ) -> Result<TcpStream> {
        let wait = self.config.reconnect_wait;
        info!("{}: waiting up to {:?} for the client to reconnect", self.context(), wait);

        let outcome = tokio::select! {
            _ = self.closed.cancelled() => {
                broker.cancel(&identity.handler_id);
                return Err(SessionError::Closed);
            }
            outcome = broker.register(identity.handler_id, wait) => outcome?,
        };
        match outcome {
            WaitOutcome::Resolved(mut stream) => {
                handshake::write_frame(&mut stream, &HandshakeOutcome::Accepted(None).to_frame()?)
                    .await?;
                Ok(stream)
            }
            WaitOutcome::TimedOut => Err(SessionError::ReconnectTimedOut(wait)),
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("role", &self.role)
            .field("remote", &self.remote)
            .field("identity", &self.identity())
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Exclusive exchange on a channel; ordinary sends wait until it is dropped
pub struct ExclusiveExchange<'a> {
    channel: &'a Channel,
    _guard: GateGuard<'a>,
}

impl ExclusiveExchange<'_> {
    /// Send one frame inside the exchange
    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        self.channel.write_frame(frame).await
    }

    /// Receive one frame inside the exchange
    pub async fn receive_frame(&self) -> Result<Frame> {
        self.channel.receive_frame().await
    }
}

struct ActiveTransfer<'a>(&'a AtomicUsize);

impl<'a> ActiveTransfer<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::AcqRel);
        Self(count)
    }
}

impl Drop for ActiveTransfer<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn link_retired() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection is being replaced")
}
