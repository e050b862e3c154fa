//! Kernel routing-netlink socket
//!
//! Thin wrapper around `netlink_sys::Socket` with the two personalities the
//! daemon needs: a blocking request/response control socket and a
//! non-blocking socket subscribed to link notifications. Message encoding and
//! decoding live in `netlink_codec`.

use crate::error::{LeafError, Result};
use crate::netlink_codec::RTNLGRP_LINK;
use netlink_sys::{Socket, SocketAddr, protocols::NETLINK_ROUTE};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Netlink socket for the routing protocol family
pub struct NetlinkSocket {
    socket: Socket,
    /// Receive buffer, reused across calls
    buffer: Vec<u8>,
    buffer_size: usize,
}

impl NetlinkSocket {
    /// Blocking socket for request/response traffic, no group membership.
    #[instrument]
    pub fn control(buffer_size: usize, timeout: Duration) -> Result<Self> {
        let mut socket = Socket::new(NETLINK_ROUTE)
            .map_err(|e| LeafError::Netlink(format!("Failed to create control socket: {}", e)))?;
        socket
            .bind(&SocketAddr::new(0, 0))
            .map_err(|e| LeafError::Netlink(format!("Failed to bind control socket: {}", e)))?;

        let nl_socket = Self {
            socket,
            buffer: Vec::with_capacity(buffer_size),
            buffer_size,
        };
        nl_socket.set_receive_timeout(timeout)?;

        debug!("Netlink control socket ready");
        Ok(nl_socket)
    }

    /// Non-blocking socket subscribed to RTNLGRP_LINK notifications.
    #[instrument]
    pub fn watch(buffer_size: usize, socket_receive_buffer: usize) -> Result<Self> {
        let mut socket = Socket::new(NETLINK_ROUTE)
            .map_err(|e| LeafError::Netlink(format!("Failed to create watch socket: {}", e)))?;

        let groups = 1 << (RTNLGRP_LINK - 1);
        socket
            .bind(&SocketAddr::new(0, groups))
            .map_err(|e| LeafError::Netlink(format!("Failed to bind watch socket: {}", e)))?;
        socket
            .set_non_blocking(true)
            .map_err(|e| LeafError::Netlink(format!("Failed to set non-blocking: {}", e)))?;

        let nl_socket = Self {
            socket,
            buffer: Vec::with_capacity(buffer_size),
            buffer_size,
        };
        nl_socket.tune_receive_buffer(socket_receive_buffer);

        debug!("Netlink watch socket bound to RTNLGRP_LINK");
        Ok(nl_socket)
    }

    fn set_receive_timeout(&self, timeout: Duration) -> Result<()> {
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        // SAFETY: fd is owned by self.socket; tv outlives the call and its size is passed.
        let ret = unsafe {
            libc::setsockopt(
                self.socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(LeafError::Netlink(format!(
                "Failed to set SO_RCVTIMEO: {}",
                io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    /// Best effort: the kernel default still works, just drops bursts sooner.
    fn tune_receive_buffer(&self, size: usize) {
        let size = size.min(libc::c_int::MAX as usize) as libc::c_int;
        // SAFETY: fd is owned by self.socket; size outlives the call and its size is passed.
        let ret = unsafe {
            libc::setsockopt(
                self.socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &size as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            warn!("Failed to set SO_RCVBUF, using default buffer size");
        } else {
            debug!(size, "Set socket receive buffer");
        }
    }

    /// Send one complete request.
    pub fn send(&self, msg: &[u8]) -> Result<()> {
        let sent = self
            .socket
            .send(msg, 0)
            .map_err(|e| LeafError::Netlink(format!("Failed to send: {}", e)))?;
        if sent != msg.len() {
            return Err(LeafError::Netlink(format!(
                "Short send: {} of {} bytes",
                sent,
                msg.len()
            )));
        }
        Ok(())
    }

    /// Receive one datagram into the internal buffer, see `datagram()`.
    ///
    /// Raw `io::Error`s are returned so callers can tell would-block and
    /// interrupted calls apart from real failures.
    pub fn recv(&mut self) -> io::Result<usize> {
        self.buffer.clear();
        self.buffer.reserve(self.buffer_size);
        self.socket.recv(&mut self.buffer, 0)
    }

    /// Bytes of the last datagram received.
    pub fn datagram(&self) -> &[u8] {
        &self.buffer
    }
}

impl AsRawFd for NetlinkSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}
