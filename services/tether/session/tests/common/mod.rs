#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tether_session::{CommandHandler, HandlerContext, HandlerFactory, Host, Result, SessionConfig};
use tether_wire::Frame;

pub struct Echo;

#[async_trait]
impl CommandHandler for Echo {
    async fn handle(&self, frame: Frame, ctx: &HandlerContext<'_>) -> Result<()> {
        ctx.reply(&frame).await
    }
}

pub struct EchoFactory;

impl HandlerFactory for EchoFactory {
    fn name(&self) -> &str {
        "echo"
    }

    fn create(&self) -> Arc<dyn CommandHandler> {
        Arc::new(Echo)
    }
}

pub fn test_config() -> SessionConfig {
    SessionConfig {
        listen_address: Ipv4Addr::LOCALHOST.into(),
        ..SessionConfig::default()
    }
}

pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn local(port: u16) -> SocketAddr {
    SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port)
}

/// Open a host with an echo acceptor on each port
pub async fn echo_host(config: &Arc<SessionConfig>, ports: &[u16]) -> Host {
    let host = Host::new(config.clone());
    for port in ports {
        host.add_acceptor(*port, Arc::new(EchoFactory)).await.unwrap();
    }
    host.open().await.unwrap();
    host
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
