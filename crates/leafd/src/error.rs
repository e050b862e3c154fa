//! Error types for leafd

use thiserror::Error;

/// Leaf interface guard errors
#[derive(Error, Debug)]
pub enum LeafError {
    /// Netlink socket or protocol error
    #[error("Netlink error: {0}")]
    Netlink(String),

    /// One or more interfaces are unknown to the kernel
    #[error("Invalid interface(s): {}", .0.join(", "))]
    InvalidInterface(Vec<String>),

    /// Interface name that the kernel could never accept
    #[error("Invalid interface name: {0:?}")]
    InvalidInterfaceName(String),

    /// Kernel reported an operational state missing from the operstate table
    #[error("Unknown kernel operational state {0}, refusing to guess link state")]
    UnknownOperState(u8),

    /// LLDP service could not be reached or subscribed to
    #[error("LLDP service unavailable: {0}")]
    LldpUnavailable(String),

    /// LLDP client protocol error
    #[error("LLDP error: {0}")]
    Lldp(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Daemonization, pidfile or log redirection error
    #[error("Daemon error: {0}")]
    Daemon(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LeafError {
    /// True for the one decode condition that must stop the daemon.
    pub fn is_fatal_decode(&self) -> bool {
        matches!(self, LeafError::UnknownOperState(_))
    }
}

/// Result type for leafd operations
pub type Result<T> = std::result::Result<T, LeafError>;

/// Process exit statuses.
pub mod exit_status {
    pub const SUCCESS: u8 = 0;
    /// Runtime failure, daemon plumbing failure, or `-h`.
    pub const FAILURE: u8 = 1;
    /// A channel could not be built or an interface failed validation.
    pub const INIT_FAILURE: u8 = 2;
    /// Arguments or configuration rejected before any channel was built.
    pub const BAD_ARGUMENTS: u8 = 3;
}
