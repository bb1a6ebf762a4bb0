//! Tether demo binary.
//!
//! `tether serve` hosts an echo handler on each configured port and
//! `tether ping` opens a session against it, exchanges echo frames on the
//! primary channel and optionally on a pooled channel, then disconnects.

use anyhow::{bail, Context};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Instant};
use tether_session::{
    Channel, CommandHandler, HandlerContext, HandlerFactory, Host, RemoteClient, SessionConfig,
};
use tether_wire::Frame;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::TetherConfig;
use logging::TetherLogFormatter;

/// Application command code used by the echo exchange
const ECHO_COMMAND: i16 = 100;

/// Tether session host and client
#[derive(Parser, Debug)]
#[command(name = "tether", version, about = "TCP session engine with recoverable channels")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Configuration file path
    #[arg(long, default_value = "tether.yaml", global = true)]
    config: PathBuf,

    /// Liveness probe interval, e.g. 30s
    #[arg(long, global = true)]
    probe_interval: Option<humantime::Duration>,

    /// Delay between reconnect attempts, e.g. 5s
    #[arg(long, global = true)]
    reconnect_backoff: Option<humantime::Duration>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host an echo handler on each port
    Serve {
        /// Port to accept on (repeatable); defaults to the configured ports
        #[arg(long = "port")]
        ports: Vec<u16>,
    },
    /// Open a session and exchange echo frames
    Ping {
        /// Host address, e.g. 127.0.0.1:7000
        #[arg(long)]
        connect: SocketAddr,

        /// Also exchange a frame on a pooled channel to this port
        #[arg(long)]
        pooled_port: Option<u16>,

        /// Payload to send
        #[arg(long, default_value = "ping")]
        message: String,
    },
}

/// Sends every application frame back unchanged
struct Echo;

#[async_trait]
impl CommandHandler for Echo {
    async fn handle(&self, frame: Frame, ctx: &HandlerContext<'_>) -> tether_session::Result<()> {
        component_debug!(
            "echo",
            "Echoing command {:?} for handler {}",
            frame.command(),
            ctx.handler_id
        );
        ctx.reply(&frame).await
    }
}

struct EchoFactory;

impl HandlerFactory for EchoFactory {
    fn name(&self) -> &str {
        "echo"
    }

    fn create(&self) -> Arc<dyn CommandHandler> {
        Arc::new(Echo)
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("tether={}", args.log_level).parse()?)
        .add_directive(format!("tether_session={}", args.log_level).parse()?)
        .add_directive(format!("tether_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(true)
        .event_format(TetherLogFormatter::new("tether".to_string()))
        .init();

    info!("Starting tether v{}", env!("CARGO_PKG_VERSION"));

    let tether_config = TetherConfig::load_from_file(&args.config)?;
    let mut session_config = tether_config.session_config()?;
    if let Some(interval) = args.probe_interval {
        session_config.probe_interval = interval.into();
    }
    if let Some(backoff) = args.reconnect_backoff {
        session_config.reconnect_backoff = backoff.into();
    }
    info!(
        "Session config: probe_interval={:?}, reconnect_backoff={:?}, max_reconnect_attempts={}, max_transfer_attempts={}, reconnect_wait={:?}",
        session_config.probe_interval,
        session_config.reconnect_backoff,
        session_config.max_reconnect_attempts,
        session_config.max_transfer_attempts,
        session_config.reconnect_wait
    );
    let session_config = Arc::new(session_config);

    match args.command {
        Command::Serve { ports } => {
            let ports = if ports.is_empty() {
                tether_config.ports.clone()
            } else {
                ports
            };
            serve(session_config, &ports).await
        }
        Command::Ping {
            connect,
            pooled_port,
            message,
        } => ping(session_config, connect, pooled_port, &message).await,
    }
}

async fn serve(config: Arc<SessionConfig>, ports: &[u16]) -> anyhow::Result<()> {
    if ports.is_empty() {
        bail!("no ports to serve; pass --port or set ports in the config file");
    }

    let host = Host::new(config);
    for port in ports {
        host.add_acceptor(*port, Arc::new(EchoFactory))
            .await
            .with_context(|| format!("failed to add acceptor on port {}", port))?;
    }

    let mut events = host.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => component_info!("host", "{}", event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    component_warn!("host", "Dropped {} host events", skipped)
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    host.open().await.context("failed to open host")?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
    }

    host.close().await;
    info!("Tether host shutdown complete");
    Ok(())
}

async fn ping(
    config: Arc<SessionConfig>,
    addr: SocketAddr,
    pooled_port: Option<u16>,
    message: &str,
) -> anyhow::Result<()> {
    let client = RemoteClient::connect(addr, config)
        .await
        .with_context(|| format!("failed to open a session with {}", addr))?;
    info!("Session {} opened with {}", client.client_id(), addr);

    let result = async {
        echo_once(client.primary(), message).await?;
        if let Some(port) = pooled_port {
            let channel = client.take_connection(port).await?;
            echo_once(&channel, message).await?;
            client.release_connection(channel)?;
        }
        anyhow::Ok(())
    }
    .await;

    if let Err(e) = client.disconnect().await {
        warn!("Disconnect from {} failed: {}", addr, e);
    }
    result
}

async fn echo_once(channel: &Channel, message: &str) -> anyhow::Result<()> {
    let frame = Frame::with_payload(ECHO_COMMAND, message.as_bytes().to_vec())?;
    let started = Instant::now();
    channel.send_frame(&frame).await?;
    let reply = channel.receive_frame().await?;
    if reply != frame {
        bail!("echo mismatch on {}", channel.context());
    }
    component_info!(
        "ping",
        "{}: echoed {} bytes in {:?}",
        channel.context(),
        message.len(),
        started.elapsed()
    );
    Ok(())
}
