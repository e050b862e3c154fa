//! Configuration file support for leafd
//!
//! Loads and validates leafd configuration from TOML files.
//! Default location: /etc/sonic/leafd.conf
//! Command-line flags override values read here.

use crate::error::{LeafError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/sonic/leafd.conf";

/// LLDP service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LldpConfig {
    /// Unix socket of the local LLDP daemon
    #[serde(default = "default_lldp_socket")]
    pub socket_path: PathBuf,

    /// How long the event loop waits before retrying a lost LLDP connection
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_ms: u64,

    /// How long the daemon may take to answer a subscription
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
}

/// Netlink configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetlinkConfig {
    /// Per-datagram receive buffer in bytes
    #[serde(default = "default_receive_buffer_size")]
    pub receive_buffer_size: usize,

    /// SO_RCVBUF for the watch socket
    #[serde(default = "default_socket_receive_buffer")]
    pub socket_receive_buffer: usize,

    /// How long a control request may wait for the kernel's reply
    #[serde(default = "default_control_timeout")]
    pub control_timeout_ms: u64,
}

/// Complete leafd configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeafdConfig {
    #[serde(default)]
    pub lldp: LldpConfig,

    #[serde(default)]
    pub netlink: NetlinkConfig,
}

// Default functions
fn default_lldp_socket() -> PathBuf {
    PathBuf::from("/var/run/lldpd.socket")
}

fn default_reconnect_interval() -> u64 {
    1000
}

fn default_handshake_timeout() -> u64 {
    2000
}

fn default_receive_buffer_size() -> usize {
    65536
}

fn default_socket_receive_buffer() -> usize {
    1024 * 1024
}

fn default_control_timeout() -> u64 {
    5000
}

// Default implementations
impl Default for LldpConfig {
    fn default() -> Self {
        Self {
            socket_path: default_lldp_socket(),
            reconnect_interval_ms: default_reconnect_interval(),
            handshake_timeout_ms: default_handshake_timeout(),
        }
    }
}

impl Default for NetlinkConfig {
    fn default() -> Self {
        Self {
            receive_buffer_size: default_receive_buffer_size(),
            socket_receive_buffer: default_socket_receive_buffer(),
            control_timeout_ms: default_control_timeout(),
        }
    }
}

impl LldpConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl NetlinkConfig {
    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }
}

impl LeafdConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => {
                let config = toml::from_str(&content).map_err(|e| {
                    LeafError::Configuration(format!(
                        "Failed to parse config file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(LeafError::Configuration(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.lldp.socket_path.as_os_str().is_empty() {
            return Err(LeafError::Configuration(
                "lldp.socket_path must not be empty".to_string(),
            ));
        }

        if !(1..=60_000).contains(&self.lldp.reconnect_interval_ms) {
            return Err(LeafError::Configuration(
                "lldp.reconnect_interval_ms must be 1-60000".to_string(),
            ));
        }

        if !(1..=60_000).contains(&self.lldp.handshake_timeout_ms) {
            return Err(LeafError::Configuration(
                "lldp.handshake_timeout_ms must be 1-60000".to_string(),
            ));
        }

        if self.netlink.receive_buffer_size < 4096 {
            return Err(LeafError::Configuration(
                "netlink.receive_buffer_size must be >= 4096".to_string(),
            ));
        }

        if self.netlink.control_timeout_ms == 0 {
            return Err(LeafError::Configuration(
                "netlink.control_timeout_ms must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}
