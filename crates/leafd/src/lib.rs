//! Leaf Interface Guard Daemon
//!
//! Keeps a set of leaf interfaces administratively down while an upstream
//! interface has no carrier, and brings them back only once LLDP confirms a
//! neighbor on the upstream again.

pub mod config_file;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod event_loop;
pub mod lldp_client;
pub mod lldp_protocol;
pub mod netlink_codec;
pub mod netlink_control;
pub mod netlink_socket;
pub mod netlink_watch;
pub mod production_features;
pub mod types;

pub use config_file::{LeafdConfig, LldpConfig, NetlinkConfig};
pub use engine::{LeafAction, Reconciler};
pub use error::*;
pub use event_loop::{EventLoop, Watcher};
pub use lldp_client::LldpClient;
pub use netlink_control::{LinkCache, LinkControl, NetlinkControl};
pub use netlink_socket::NetlinkSocket;
pub use netlink_watch::NetlinkWatch;
pub use production_features::SystemdNotifier;
pub use types::*;
