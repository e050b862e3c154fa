//! Netlink watch channel
//!
//! Subscribed, non-blocking socket that turns kernel link notifications into
//! `LinkEvent`s. Kept separate from the control channel so asynchronous
//! notifications never interleave with command/response pairs.

use crate::config_file::NetlinkConfig;
use crate::error::{LeafError, Result};
use crate::event_loop::Watcher;
use crate::netlink_codec::decode_link_events;
use crate::netlink_socket::NetlinkSocket;
use crate::types::LinkEvent;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use tracing::{debug, instrument};

pub struct NetlinkWatch {
    socket: NetlinkSocket,
}

impl NetlinkWatch {
    #[instrument(skip(config))]
    pub fn new(config: &NetlinkConfig) -> Result<Self> {
        let socket =
            NetlinkSocket::watch(config.receive_buffer_size, config.socket_receive_buffer)?;
        Ok(Self { socket })
    }
}

impl Watcher for NetlinkWatch {
    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.socket.as_raw_fd())
    }

    /// Drain every pending datagram.
    ///
    /// An unknown kernel operstate aborts the drain with the fatal error.
    fn receive(&mut self) -> Result<Vec<LinkEvent>> {
        let mut events = Vec::new();
        loop {
            match self.socket.recv() {
                Ok(0) => break,
                Ok(_) => events.extend(decode_link_events(self.socket.datagram())?),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    return Err(LeafError::Netlink(format!(
                        "Failed to receive link notification: {}",
                        e
                    )));
                }
            }
        }
        if !events.is_empty() {
            debug!(count = events.len(), "Received link notifications");
        }
        Ok(events)
    }
}
