//! Netlink control channel
//!
//! Synchronous request/response access to the kernel link table: checking
//! that configured interfaces exist and flipping their administrative up flag.
//! The interface cache is fetched fresh for every call because interface
//! indices can change underneath a long-running process.

use crate::config_file::NetlinkConfig;
use crate::error::{LeafError, Result};
use crate::netlink_codec::{
    MessageCursor, NLMSG_DONE, NLMSG_ERROR, NLMSG_NOOP, RTM_NEWLINK, decode_ack,
    decode_link_entry, encode_admin_state_request, encode_link_dump_request,
};
use crate::netlink_socket::NetlinkSocket;
use crate::types::{AdminState, InterfaceName};
use std::collections::HashMap;
use std::io;
use tracing::{debug, info, instrument, trace, warn};

/// Administrative control over kernel interfaces.
#[cfg_attr(test, mockall::automock)]
pub trait LinkControl {
    /// Fail with `InvalidInterface` naming every name the kernel does not know.
    fn interfaces_exist(&mut self, names: &[InterfaceName]) -> Result<()>;

    /// Set or clear IFF_UP on every resolvable name, skipping the rest.
    ///
    /// Returns only after the kernel has acknowledged each request.
    fn set_interfaces_state(&mut self, names: &[InterfaceName], state: AdminState) -> Result<()>;
}

/// Snapshot of the kernel's interface table, name to index.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkCache {
    links: HashMap<String, i32>,
}

impl LinkCache {
    pub fn insert(&mut self, name: String, index: i32) {
        self.links.insert(name, index);
    }

    pub fn index_of(&self, name: &str) -> Option<i32> {
        self.links.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Names from `names` absent from the cache, in input order.
    pub fn missing(&self, names: &[InterfaceName]) -> Vec<String> {
        names
            .iter()
            .filter(|n| self.index_of(n.as_str()).is_none())
            .map(|n| n.to_string())
            .collect()
    }
}

/// Outcome of feeding one dump datagram into a `LinkCache`.
#[derive(Debug, PartialEq, Eq)]
enum DumpProgress {
    More,
    Done,
}

/// Fold one RTM_GETLINK dump datagram into `cache`.
fn collect_dump(cache: &mut LinkCache, seq: u32, datagram: &[u8]) -> Result<DumpProgress> {
    for (header, payload) in MessageCursor::new(datagram) {
        if header.seq != seq {
            trace!(seq = header.seq, expected = seq, "Skipping stale netlink reply");
            continue;
        }
        match header.msg_type {
            NLMSG_DONE => return Ok(DumpProgress::Done),
            NLMSG_NOOP => {}
            NLMSG_ERROR => {
                let errno = decode_ack(payload).unwrap_or(libc::EIO);
                return Err(LeafError::Netlink(format!(
                    "Link dump failed: {}",
                    io::Error::from_raw_os_error(errno)
                )));
            }
            RTM_NEWLINK => {
                if let Some((index, name)) = decode_link_entry(payload) {
                    cache.insert(name, index);
                }
            }
            other => trace!(msg_type = other, "Ignoring unexpected dump message"),
        }
    }
    Ok(DumpProgress::More)
}

/// Errno of the ACK for `seq` in `datagram`, if present.
fn find_ack(seq: u32, datagram: &[u8]) -> Option<i32> {
    MessageCursor::new(datagram)
        .filter(|(header, _)| header.msg_type == NLMSG_ERROR && header.seq == seq)
        .find_map(|(_, payload)| decode_ack(payload))
}

/// Apply `state` to every name resolvable in `cache`, one request at a time.
///
/// `command` sends the request for one interface index and returns the
/// kernel's errno. A vanished name, a rejected request or a failed command is
/// logged and skipped. Returns how many interfaces the kernel accepted.
fn apply_admin_state<F>(
    cache: &LinkCache,
    names: &[InterfaceName],
    state: AdminState,
    mut command: F,
) -> usize
where
    F: FnMut(i32) -> Result<i32>,
{
    let mut applied = 0;
    for name in names {
        let Some(index) = cache.index_of(name.as_str()) else {
            debug!(ifname = %name, "Interface vanished, skipping");
            continue;
        };
        match command(index) {
            Ok(0) => {
                info!(ifname = %name, %state, "Set admin state");
                applied += 1;
            }
            Ok(errno) => warn!(
                ifname = %name,
                %state,
                error = %io::Error::from_raw_os_error(errno),
                "Kernel rejected admin state change, skipping"
            ),
            Err(e) => warn!(
                ifname = %name,
                %state,
                error = %e,
                "Admin state change failed, skipping"
            ),
        }
    }
    applied
}

/// Control channel backed by its own, unsubscribed netlink socket
pub struct NetlinkControl {
    socket: NetlinkSocket,
    seq: u32,
}

impl NetlinkControl {
    #[instrument(skip(config))]
    pub fn new(config: &NetlinkConfig) -> Result<Self> {
        let socket = NetlinkSocket::control(config.receive_buffer_size, config.control_timeout())?;
        Ok(Self { socket, seq: 0 })
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    fn recv(&mut self) -> Result<&[u8]> {
        loop {
            match self.socket.recv() {
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Err(LeafError::Netlink(
                        "Timed out waiting for kernel reply".to_string(),
                    ));
                }
                Err(e) => {
                    return Err(LeafError::Netlink(format!("Failed to receive: {}", e)));
                }
            }
        }
        Ok(self.socket.datagram())
    }

    /// Fetch the current interface table from the kernel.
    pub fn fetch_links(&mut self) -> Result<LinkCache> {
        let seq = self.next_seq();
        self.socket.send(&encode_link_dump_request(seq))?;

        let mut cache = LinkCache::default();
        loop {
            let datagram = self.recv()?;
            if collect_dump(&mut cache, seq, datagram)? == DumpProgress::Done {
                break;
            }
        }
        trace!(links = cache.len(), "Fetched link cache");
        Ok(cache)
    }

    /// Issue one admin state change and wait for its ACK; returns the kernel errno.
    fn change_admin_state(&mut self, index: i32, state: AdminState) -> Result<i32> {
        let seq = self.next_seq();
        self.socket
            .send(&encode_admin_state_request(seq, index, state))?;
        loop {
            let datagram = self.recv()?;
            if let Some(errno) = find_ack(seq, datagram) {
                return Ok(errno);
            }
        }
    }
}

impl LinkControl for NetlinkControl {
    fn interfaces_exist(&mut self, names: &[InterfaceName]) -> Result<()> {
        let cache = self.fetch_links()?;
        let missing = cache.missing(names);
        if missing.is_empty() {
            return Ok(());
        }
        for name in &missing {
            warn!(ifname = %name, "Not a valid interface");
        }
        Err(LeafError::InvalidInterface(missing))
    }

    fn set_interfaces_state(&mut self, names: &[InterfaceName], state: AdminState) -> Result<()> {
        let cache = self.fetch_links()?;
        let applied = apply_admin_state(&cache, names, state, |index| {
            self.change_admin_state(index, state)
        });
        debug!(applied, requested = names.len(), %state, "Admin state pass complete");
        Ok(())
    }
}
