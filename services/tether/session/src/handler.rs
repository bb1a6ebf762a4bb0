//! Server-side handler lifecycle.
//!
//! Each accepted channel is served by one [`Handler`] running a single serve
//! loop. `STOP_HANDLER` frames are routed to the owning session; every other
//! frame goes to the application's [`CommandHandler`].

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tether_wire::{command, CborCodec, Frame};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::Channel;
use crate::error::{FailureKind, Result, SessionError};
use crate::ids::{ClientId, HandlerId};
use crate::registry::ConnectedClient;

tokio::task_local! {
    // Handler whose callback the current task is running
    static IN_CALLBACK: HandlerId;
}

/// How a handler should stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopMode {
    /// Let the running callback finish, then close
    Soft,
    /// Close the socket at once
    Hard,
}

/// Payload of a `STOP_HANDLER` frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerStopRequest {
    /// Handler to stop, on any channel of the session
    pub handler_id: HandlerId,
    /// How to stop it
    pub mode: StopMode,
}

impl HandlerStopRequest {
    /// Encode as a `STOP_HANDLER` frame
    pub fn to_frame(&self) -> Result<Frame> {
        Ok(Frame::with_value(command::STOP_HANDLER, self, &CborCodec)?)
    }
}

/// Lifecycle state of a [`Handler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandlerState {
    /// Serving frames
    Running = 0,
    /// Waiting for the running callback before cleanup
    StoppingSoft = 1,
    /// Socket closed, cleanup pending
    StoppingHard = 2,
    /// Cleaned up; terminal
    Stopped = 3,
}

impl HandlerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => HandlerState::Running,
            1 => HandlerState::StoppingSoft,
            2 => HandlerState::StoppingHard,
            _ => HandlerState::Stopped,
        }
    }
}

impl fmt::Display for HandlerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerState::Running => write!(f, "running"),
            HandlerState::StoppingSoft => write!(f, "stopping (soft)"),
            HandlerState::StoppingHard => write!(f, "stopping (hard)"),
            HandlerState::Stopped => write!(f, "stopped"),
        }
    }
}

/// What a command callback sees of its handler
pub struct HandlerContext<'a> {
    /// Channel the frame arrived on
    pub channel: &'a Channel,
    /// Session of the handler
    pub client_id: ClientId,
    /// The handler's id
    pub handler_id: HandlerId,
    /// The handler's name
    pub name: &'a str,
}

impl HandlerContext<'_> {
    /// Send a frame back to the client
    pub async fn reply(&self, frame: &Frame) -> Result<()> {
        self.channel.send_frame(frame).await
    }
}

/// Application callback invoked for every non-control frame
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Handle one frame; an error ends the serve loop
    async fn handle(&self, frame: Frame, ctx: &HandlerContext<'_>) -> Result<()>;
}

/// Builds the callback for each handler an acceptor starts
pub trait HandlerFactory: Send + Sync {
    /// Name given to handlers built by this factory
    fn name(&self) -> &str;

    /// Callback for one new handler
    fn create(&self) -> Arc<dyn CommandHandler>;
}

/// Serves one accepted channel of a session
pub struct Handler {
    id: HandlerId,
    client_id: ClientId,
    name: String,
    channel: Arc<Channel>,
    callback: Arc<dyn CommandHandler>,
    owner: Weak<ConnectedClient>,
    state: AtomicU8,
    hard_stopped: AtomicBool,
    cleaned: AtomicBool,
    in_flight: Mutex<()>,
    finished: CancellationToken,
}

impl Handler {
    /// Create a handler owned by `owner`; call [`start`](Self::start) to serve
    pub fn new(
        id: HandlerId,
        owner: &Arc<ConnectedClient>,
        name: impl Into<String>,
        channel: Arc<Channel>,
        callback: Arc<dyn CommandHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            client_id: owner.id(),
            name: name.into(),
            channel,
            callback,
            owner: Arc::downgrade(owner),
            state: AtomicU8::new(HandlerState::Running as u8),
            hard_stopped: AtomicBool::new(false),
            cleaned: AtomicBool::new(false),
            in_flight: Mutex::new(()),
            finished: CancellationToken::new(),
        })
    }

    /// Handler id
    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Owning session
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Factory name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Channel being served
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Current lifecycle state
    pub fn state(&self) -> HandlerState {
        HandlerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Wait until cleanup has run
    pub async fn stopped(&self) {
        self.finished.cancelled().await
    }

    /// Spawn the serve loop
    pub fn start(self: &Arc<Self>) {
        let handler = self.clone();
        tokio::spawn(async move {
            handler.serve().await;
        });
    }

    fn stopping(&self) -> bool {
        self.state() != HandlerState::Running
    }

    /// Move out of `Running`; later requests keep the first stop mode
    fn begin_stop(&self, next: HandlerState) {
        let _ = self.state.compare_exchange(
            HandlerState::Running as u8,
            next as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    async fn serve(self: Arc<Self>) {
        info!("{}: handler started", self.channel.context());
        let ctx = HandlerContext {
            channel: &self.channel,
            client_id: self.client_id,
            handler_id: self.id,
            name: &self.name,
        };

        let outcome: Result<()> = loop {
            if self.stopping() {
                break Ok(());
            }
            let frame = match self.channel.receive_frame().await {
                Ok(frame) => frame,
                Err(e) => break Err(e),
            };

            if frame.command() == Some(command::STOP_HANDLER) {
                if let Err(e) = self.forward_stop(&frame).await {
                    warn!("{}: stop request failed: {}", self.channel.context(), e);
                }
                continue;
            }

            let _in_flight = self.in_flight.lock().await;
            if self.stopping() {
                break Ok(());
            }
            let handled = IN_CALLBACK
                .scope(self.id, self.callback.handle(frame, &ctx))
                .await;
            if let Err(e) = handled {
                break Err(e);
            }
        };

        match outcome {
            Ok(()) => debug!("{}: serve loop finished", self.channel.context()),
            Err(_) if self.hard_stopped.load(Ordering::Acquire) => {
                info!("{}: handler hard stopped", self.channel.context())
            }
            Err(e) if self.stopping() || e.kind() == FailureKind::Shutdown => {
                debug!("{}: serve loop ended while stopping: {}", self.channel.context(), e)
            }
            Err(SessionError::PeerClosed) => {
                info!("{}: client closed the connection", self.channel.context())
            }
            Err(e) => error!("{}: handler failed: {}", self.channel.context(), e),
        }
        self.cleanup().await;
    }

    async fn forward_stop(&self, frame: &Frame) -> Result<()> {
        let request: HandlerStopRequest = frame.value(&CborCodec)?;
        debug!(
            "{}: {:?} stop requested for handler {}",
            self.channel.context(),
            request.mode,
            request.handler_id
        );
        let owner = self
            .owner
            .upgrade()
            .ok_or(SessionError::ClientNotFound(self.client_id))?;
        owner.stop_handler(request.handler_id, request.mode).await
    }

    /// Stop the handler; cleanup runs once however many stops race.
    ///
    /// A soft stop issued from the handler's own callback only marks the
    /// handler. The serve loop cleans up once that callback returns.
    pub async fn stop(&self, mode: StopMode) {
        match mode {
            StopMode::Soft => {
                self.begin_stop(HandlerState::StoppingSoft);
                if self.in_own_callback() {
                    debug!("{}: soft stop deferred to the serve loop", self.channel.context());
                    return;
                }
                // Wait out a running callback
                let _idle = self.in_flight.lock().await;
            }
            StopMode::Hard => {
                self.begin_stop(HandlerState::StoppingHard);
                self.hard_stopped.store(true, Ordering::Release);
                self.channel.close().await;
            }
        }
        self.cleanup().await;
    }

    fn in_own_callback(&self) -> bool {
        IN_CALLBACK.try_with(|id| *id == self.id).unwrap_or(false)
    }

    async fn cleanup(&self) {
        if self
            .cleaned
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.channel.close().await;
        self.state.store(HandlerState::Stopped as u8, Ordering::Release);
        if let Some(owner) = self.owner.upgrade() {
            owner.remove_handler(self.id);
        }
        debug!("{}: handler cleaned up", self.channel.context());
        self.finished.cancel();
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::events::HostEvent;
    use crate::registry::ClientRegistry;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::{broadcast, Notify};

    struct Echo {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CommandHandler for Echo {
        async fn handle(&self, frame: Frame, ctx: &HandlerContext<'_>) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ctx.reply(&frame).await
        }
    }

    /// Blocks inside the callback until released
    struct Gate {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl CommandHandler for Gate {
        async fn handle(&self, _frame: Frame, _ctx: &HandlerContext<'_>) -> Result<()> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    async fn spawn_handler(
        callback: Arc<dyn CommandHandler>,
    ) -> (Arc<Channel>, Arc<Handler>, Arc<ClientRegistry>) {
        let config = Arc::new(SessionConfig::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(Channel::open(addr, config.clone()), listener.accept());
        let server = Channel::accepted(accepted.unwrap().0, config).unwrap();

        let (events, _) = broadcast::channel::<HostEvent>(16);
        let registry = ClientRegistry::new(events);
        let session = registry.create_client();
        let handler_id = HandlerId::new();
        let handler = Handler::new(handler_id, &session, "test", server.clone(), callback);
        session.register_handler(handler.clone()).unwrap();
        server
            .initialize_on_server(session.id(), handler_id, "test", session.broker())
            .unwrap();
        handler.start();
        (client.unwrap(), handler, registry)
    }

    #[tokio::test]
    async fn test_serve_loop_dispatches() {
        let echo = Arc::new(Echo {
            calls: AtomicUsize::new(0),
        });
        let (client, handler, _registry) = spawn_handler(echo.clone()).await;

        let frame = Frame::with_payload(100, b"hello".to_vec()).unwrap();
        client.send_frame(&frame).await.unwrap();
        assert_eq!(client.receive_frame().await.unwrap(), frame);
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
        assert_eq!(handler.state(), HandlerState::Running);
    }

    #[tokio::test]
    async fn test_stop_request_frame() {
        let (client, handler, registry) = spawn_handler(Arc::new(Echo {
            calls: AtomicUsize::new(0),
        }))
        .await;
        assert_eq!(registry.count(), 1);

        let request = HandlerStopRequest {
            handler_id: handler.id(),
            mode: StopMode::Soft,
        };
        client.send_frame(&request.to_frame().unwrap()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), handler.stopped())
            .await
            .unwrap();
        assert_eq!(handler.state(), HandlerState::Stopped);
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_soft_stop_waits_for_callback() {
        let gate = Arc::new(Gate {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let (client, handler, _registry) = spawn_handler(gate.clone()).await;

        client.send_frame(&Frame::control(100).unwrap()).await.unwrap();
        gate.entered.notified().await;

        let stopping = {
            let handler = handler.clone();
            tokio::spawn(async move { handler.stop(StopMode::Soft).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!stopping.is_finished());
        assert_eq!(handler.state(), HandlerState::StoppingSoft);

        gate.release.notify_one();
        stopping.await.unwrap();
        assert_eq!(handler.state(), HandlerState::Stopped);
        assert!(handler.channel().is_closed());
    }

    #[tokio::test]
    async fn test_hard_stop_and_single_cleanup() {
        let (_client, handler, registry) = spawn_handler(Arc::new(Echo {
            calls: AtomicUsize::new(0),
        }))
        .await;
        let mut events = registry.subscribe();

        tokio::join!(handler.stop(StopMode::Hard), handler.stop(StopMode::Soft));
        assert_eq!(handler.state(), HandlerState::Stopped);
        assert!(handler.channel().is_closed());

        let mut removed = 0;
        while let Ok(event) = events.try_recv() {
            if event.reason == crate::events::ChangeReason::HandlerRemoved {
                removed += 1;
            }
        }
        assert_eq!(removed, 1);
    }

    /// Soft-stops its own handler from inside the callback
    struct StopSelf {
        handler: std::sync::OnceLock<Weak<Handler>>,
    }

    #[async_trait]
    impl CommandHandler for StopSelf {
        async fn handle(&self, _frame: Frame, _ctx: &HandlerContext<'_>) -> Result<()> {
            if let Some(handler) = self.handler.get().and_then(Weak::upgrade) {
                handler.stop(StopMode::Soft).await;
                assert_eq!(handler.state(), HandlerState::StoppingSoft);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_soft_stop_from_own_callback() {
        let callback = Arc::new(StopSelf {
            handler: std::sync::OnceLock::new(),
        });
        let (client, handler, registry) = spawn_handler(callback.clone()).await;
        callback.handler.set(Arc::downgrade(&handler)).unwrap();

        client.send_frame(&Frame::control(100).unwrap()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), handler.stopped())
            .await
            .unwrap();
        assert_eq!(handler.state(), HandlerState::Stopped);
        assert!(handler.channel().is_closed());
        assert_eq!(registry.count(), 0);
    }
}
