//! Configuration handling for the tether binary.
//!
//! Settings come from an optional YAML file, then `TETHER_*` environment
//! variables, then the command line. Durations are humantime strings such
//! as `10s` or `10m`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use tether_session::{KeepAliveSettings, SessionConfig};
use tracing::{info, warn};

/// Keep-alive section of the YAML file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAliveConfig {
    pub enabled: bool,
    pub time: String,
    pub interval: String,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        let defaults = KeepAliveSettings::default();
        Self {
            enabled: defaults.enabled,
            time: format_duration(defaults.time),
            interval: format_duration(defaults.interval),
        }
    }
}

/// Tether service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    /// Ports served by `tether serve` when none are given on the command line
    pub ports: Vec<u16>,
    pub probe_interval: String,
    pub reconnect_backoff: String,
    pub max_reconnect_attempts: u32,
    pub max_transfer_attempts: u32,
    pub reconnect_wait: String,
    pub listen_address: IpAddr,
    pub listen_backlog: u32,
    pub keep_alive: KeepAliveConfig,
    /// Largest payload in bytes a received frame may announce
    pub max_payload_size: usize,
}

impl Default for TetherConfig {
    fn default() -> Self {
        let defaults = SessionConfig::default();
        Self {
            ports: vec![7000],
            probe_interval: format_duration(defaults.probe_interval),
            reconnect_backoff: format_duration(defaults.reconnect_backoff),
            max_reconnect_attempts: defaults.max_reconnect_attempts,
            max_transfer_attempts: defaults.max_transfer_attempts,
            reconnect_wait: format_duration(defaults.reconnect_wait),
            listen_address: defaults.listen_address,
            listen_backlog: defaults.listen_backlog,
            keep_alive: KeepAliveConfig::default(),
            max_payload_size: defaults.max_payload_size,
        }
    }
}

impl TetherConfig {
    /// Load configuration from file and environment variables.
    ///
    /// A missing file falls back to the defaults; a file that does not
    /// parse is an error.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config: Self = serde_yaml::from_str(&content)
                    .with_context(|| format!("failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                config
            }
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_environment_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `TETHER_*` overrides; `lookup` reads one variable
    fn apply_environment_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(ports) = lookup("TETHER_PORTS") {
            let parsed: std::result::Result<Vec<u16>, _> =
                ports.split(',').map(|p| p.trim().parse::<u16>()).collect();
            match parsed {
                Ok(ports) => {
                    info!("Ports overridden by environment: {:?}", ports);
                    self.ports = ports;
                }
                Err(e) => warn!("Ignoring TETHER_PORTS={:?}: {}", ports, e),
            }
        }

        for (key, field) in [
            ("TETHER_PROBE_INTERVAL", &mut self.probe_interval),
            ("TETHER_RECONNECT_BACKOFF", &mut self.reconnect_backoff),
            ("TETHER_RECONNECT_WAIT", &mut self.reconnect_wait),
        ] {
            if let Some(value) = lookup(key) {
                info!("{} overridden by environment: {}", key, value);
                *field = value;
            }
        }

        for (key, field) in [
            ("TETHER_MAX_RECONNECT_ATTEMPTS", &mut self.max_reconnect_attempts),
            ("TETHER_MAX_TRANSFER_ATTEMPTS", &mut self.max_transfer_attempts),
        ] {
            if let Some(value) = lookup(key) {
                match value.parse::<u32>() {
                    Ok(parsed) => *field = parsed,
                    Err(e) => warn!("Ignoring {}={:?}: {}", key, value, e),
                }
            }
        }

        if let Some(address) = lookup("TETHER_LISTEN_ADDRESS") {
            match address.parse::<IpAddr>() {
                Ok(parsed) => self.listen_address = parsed,
                Err(e) => warn!("Ignoring TETHER_LISTEN_ADDRESS={:?}: {}", address, e),
            }
        }
    }

    /// Build the session configuration handed to hosts and clients
    pub fn session_config(&self) -> Result<SessionConfig> {
        Ok(SessionConfig {
            probe_interval: parse_duration("probe_interval", &self.probe_interval)?,
            reconnect_backoff: parse_duration("reconnect_backoff", &self.reconnect_backoff)?,
            max_reconnect_attempts: self.max_reconnect_attempts,
            max_transfer_attempts: self.max_transfer_attempts,
            reconnect_wait: parse_duration("reconnect_wait", &self.reconnect_wait)?,
            listen_address: self.listen_address,
            listen_backlog: self.listen_backlog,
            keep_alive: KeepAliveSettings {
                enabled: self.keep_alive.enabled,
                time: parse_duration("keep_alive.time", &self.keep_alive.time)?,
                interval: parse_duration("keep_alive.interval", &self.keep_alive.interval)?,
            },
            max_payload_size: self.max_payload_size,
        })
    }
}

fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).with_context(|| format!("invalid duration for {}: {:?}", field, value))
}

fn format_duration(duration: Duration) -> String {
    humantime::format_duration(duration).to_string()
}
