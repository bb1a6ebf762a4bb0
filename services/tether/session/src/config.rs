//! Session tunables.
//!
//! A single [`SessionConfig`] is built by the embedding process, wrapped in
//! an `Arc`, and handed to every host, client and channel it creates.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Default cap on received payloads (16 MiB)
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// TCP keep-alive settings applied to accepted sockets
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeepAliveSettings {
    /// Whether keep-alive is enabled
    pub enabled: bool,
    /// Idle time before the first keep-alive probe
    pub time: Duration,
    /// Interval between keep-alive probes
    pub interval: Duration,
}

impl Default for KeepAliveSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            time: Duration::from_millis(1000),
            interval: Duration::from_millis(1000),
        }
    }
}

/// Configuration shared by every session component
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Period of the liveness probe timer on each channel
    pub probe_interval: Duration,
    /// Delay before each initiator reconnect attempt
    pub reconnect_backoff: Duration,
    /// Reconnect attempts before the initiator gives up
    pub max_reconnect_attempts: u32,
    /// Attempts of one send or receive before it fails
    pub max_transfer_attempts: u32,
    /// How long an acceptor waits for the initiator to come back
    pub reconnect_wait: Duration,
    /// Address acceptors bind to
    pub listen_address: IpAddr,
    /// Listen backlog for each acceptor
    pub listen_backlog: u32,
    /// Keep-alive applied to accepted sockets
    pub keep_alive: KeepAliveSettings,
    /// Largest payload a received frame may announce
    pub max_payload_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(60),
            reconnect_backoff: Duration::from_secs(10),
            max_reconnect_attempts: 20,
            max_transfer_attempts: 10,
            reconnect_wait: Duration::from_secs(10 * 60),
            listen_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_backlog: 10,
            keep_alive: KeepAliveSettings::default(),
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}
