//! TCP transport for tether channels.
//!
//! Plain TCP only. Accepted sockets get OS-level keep-alive through the
//! [`KeepAlive`] capability; how the parameters reach the kernel is left to
//! `socket2`.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpSocket, TcpStream};

/// Socket-level keep-alive control
pub trait KeepAlive {
    /// Enable or disable keep-alive with the given idle time and probe interval
    fn set_keep_alive(&self, enabled: bool, time_ms: u32, interval_ms: u32) -> io::Result<()>;
}

impl KeepAlive for TcpStream {
    fn set_keep_alive(&self, enabled: bool, time_ms: u32, interval_ms: u32) -> io::Result<()> {
        let socket = SockRef::from(self);
        if !enabled {
            return socket.set_keepalive(false);
        }
        let params = TcpKeepalive::new()
            .with_time(Duration::from_millis(time_ms.into()))
            .with_interval(Duration::from_millis(interval_ms.into()));
        socket.set_tcp_keepalive(&params)
    }
}

/// Create a TCP listener bound to the given address
pub fn listen_tcp(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

/// Connect to a TCP address
pub async fn connect_tcp(addr: SocketAddr) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[tokio::test]
    async fn test_tcp_listen_connect() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = listen_tcp(addr, 10).unwrap();
        let bound_addr = listener.local_addr().unwrap();

        let stream = connect_tcp(bound_addr).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), bound_addr);

        let (accepted, _) = listener.accept().await.unwrap();
        assert!(accepted.set_keep_alive(true, 1000, 1000).is_ok());
        assert!(SockRef::from(&accepted).keepalive().unwrap());

        assert!(accepted.set_keep_alive(false, 0, 0).is_ok());
        assert!(!SockRef::from(&accepted).keepalive().unwrap());
    }
}
