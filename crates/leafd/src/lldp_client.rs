//! LLDP client
//!
//! Connects to the local LLDP daemon's control socket, subscribes to
//! neighbor-table changes and turns notifications into `LinkEvent`s.
//!
//! A lost connection is not re-established eagerly: it is marked closed, the
//! event loop stops polling it, and the next `receive()` reconnects. A
//! reconnect only connects and sends SUBSCRIBE on a non-blocking socket; the
//! reply is read when the socket turns readable, and a reply that misses its
//! deadline closes the connection again. Only the initial `connect()` waits
//! for the reply, before the event loop starts.

use crate::error::{LeafError, Result};
use crate::event_loop::{Watcher, timeout_for};
use crate::lldp_protocol::{
    FrameDecoder, MSG_NOTIFICATION, MSG_SUBSCRIBE, NeighborChange, encode_frame,
};
use crate::types::LinkEvent;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, poll};
use nix::sys::socket::{AddressFamily, SockFlag, SockType, UnixAddr, connect, socket};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, trace, warn};

/// Per-read chunk when draining the socket.
const READ_CHUNK: usize = 4096;

/// What a drain pass observed on the socket.
#[derive(Debug, PartialEq, Eq)]
enum Drain {
    Open,
    Eof,
}

/// Subscription progress of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    /// SUBSCRIBE sent; the reply must arrive before the deadline.
    AwaitingReply { deadline: Instant },
    Subscribed,
}

/// Non-blocking connection to the LLDP daemon
#[derive(Debug)]
struct Connection {
    stream: UnixStream,
    decoder: FrameDecoder,
    stage: Stage,
}

impl Connection {
    /// Connect and send SUBSCRIBE without waiting on the daemon.
    ///
    /// A daemon whose listen backlog is full refuses with EAGAIN instead of
    /// making the caller wait.
    fn start(path: &Path, handshake_timeout: Duration) -> Result<Self> {
        let unavailable = |what: &str, e: &dyn std::fmt::Display| {
            LeafError::LldpUnavailable(format!("{} on {}: {}", what, path.display(), e))
        };

        let fd = socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(|e| unavailable("socket", &e))?;
        let addr = UnixAddr::new(path).map_err(|e| unavailable("address", &e))?;
        connect(fd.as_raw_fd(), &addr).map_err(|e| unavailable("connect", &e))?;

        let mut stream = UnixStream::from(fd);
        let request = encode_frame(MSG_SUBSCRIBE, &[]);
        match stream.write(&request) {
            Ok(n) if n == request.len() => {}
            Ok(n) => {
                return Err(LeafError::LldpUnavailable(format!(
                    "short subscribe write ({} of {} bytes)",
                    n,
                    request.len()
                )));
            }
            Err(e) => return Err(unavailable("subscribe", &e)),
        }

        Ok(Self {
            stream,
            decoder: FrameDecoder::new(),
            stage: Stage::AwaitingReply {
                deadline: Instant::now() + handshake_timeout,
            },
        })
    }

    fn is_subscribed(&self) -> bool {
        self.stage == Stage::Subscribed
    }

    fn deadline(&self) -> Option<Instant> {
        match self.stage {
            Stage::AwaitingReply { deadline } => Some(deadline),
            Stage::Subscribed => None,
        }
    }

    /// Read toward the SUBSCRIBE reply, never past it.
    ///
    /// Notifications sent right after the reply stay queued in the socket,
    /// where the event loop will see them. Returns once subscribed or once the
    /// socket has nothing more to give.
    fn read_reply(&mut self) -> Result<()> {
        if self.is_subscribed() {
            return Ok(());
        }
        let protocol = |e: LeafError| LeafError::LldpUnavailable(e.to_string());
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let want = self.decoder.missing().map_err(protocol)?;
            if want == 0 {
                break;
            }
            match self.stream.read(&mut chunk[..want.min(READ_CHUNK)]) {
                Ok(0) => {
                    return Err(LeafError::LldpUnavailable(
                        "connection closed before subscribe reply".to_string(),
                    ));
                }
                Ok(n) => self.decoder.feed(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    return Err(LeafError::LldpUnavailable(format!(
                        "subscribe reply: {}",
                        e
                    )));
                }
            }
        }

        match self.decoder.next_frame().map_err(protocol)? {
            Some(frame) if frame.msg_type == MSG_SUBSCRIBE => {
                self.stage = Stage::Subscribed;
                Ok(())
            }
            Some(frame) => Err(LeafError::LldpUnavailable(format!(
                "unexpected reply type {} to subscribe",
                frame.msg_type
            ))),
            None => Ok(()),
        }
    }

    /// Block until subscribed; used only before the event loop starts.
    fn wait_subscribed(&mut self) -> Result<()> {
        loop {
            self.read_reply()?;
            let Some(deadline) = self.deadline() else {
                return Ok(());
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(LeafError::LldpUnavailable(
                    "timed out waiting for subscribe reply".to_string(),
                ));
            }
            let mut fds = [PollFd::new(self.stream.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, timeout_for(remaining)) {
                Ok(_) | Err(Errno::EINTR) => {}
                Err(e) => {
                    return Err(LeafError::LldpUnavailable(format!(
                        "waiting for subscribe reply: {}",
                        e
                    )));
                }
            }
        }
    }

    /// Read everything the socket has buffered into the frame decoder.
    fn drain(&mut self) -> io::Result<Drain> {
        let mut chunk = [0u8; READ_CHUNK];
        let mut total = 0usize;
        loop {
            let available = bytes_available(self.stream.as_raw_fd())?;
            if available == 0 && total > 0 {
                break;
            }
            // With nothing reported, one read still tells EOF apart from would-block.
            let want = available.clamp(1, READ_CHUNK);
            match self.stream.read(&mut chunk[..want]) {
                Ok(0) => return Ok(Drain::Eof),
                Ok(n) => {
                    self.decoder.feed(&chunk[..n]);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        trace!(bytes = total, pending = self.decoder.pending(), "Drained LLDP socket");
        Ok(Drain::Open)
    }

    /// Decode every complete frame; an error means the stream is unusable.
    fn decode(&mut self, events: &mut Vec<LinkEvent>) -> Result<()> {
        while let Some(frame) = self.decoder.next_frame()? {
            if frame.msg_type != MSG_NOTIFICATION {
                trace!(msg_type = frame.msg_type, "Ignoring LLDP message");
                continue;
            }
            let change = NeighborChange::decode(&frame.payload)?;
            debug!(
                ifname = %change.local_ifname,
                remote_ifname = ?change.remote_ifname,
                remote_fqdn = ?change.remote_fqdn,
                kind = ?change.kind,
                "LLDP neighbor change"
            );
            match change.into_event() {
                Ok(event) => events.push(event),
                Err(e) => warn!(error = %e, "Dropping LLDP notification"),
            }
        }
        Ok(())
    }
}

/// Bytes readable on `fd` without blocking.
fn bytes_available(fd: RawFd) -> io::Result<usize> {
    let mut available: libc::c_int = 0;
    // SAFETY: fd is a live socket owned by the caller; FIONREAD writes one c_int.
    let ret = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut available as *mut libc::c_int) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(available.max(0) as usize)
}

/// Client for the local LLDP daemon with lazy reconnect
#[derive(Debug)]
pub struct LldpClient {
    socket_path: PathBuf,
    handshake_timeout: Duration,
    connection: Option<Connection>,
}

impl LldpClient {
    /// Connect and subscribe, waiting at most `handshake_timeout` for the
    /// reply; any failure is `LldpUnavailable`.
    #[instrument(skip_all, fields(path = %socket_path.as_ref().display()))]
    pub fn connect(socket_path: impl AsRef<Path>, handshake_timeout: Duration) -> Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();
        let mut connection = Connection::start(&socket_path, handshake_timeout)?;
        connection.wait_subscribed()?;
        info!(path = %socket_path.display(), "Subscribed to LLDP neighbor changes");
        Ok(Self {
            socket_path,
            handshake_timeout,
            connection: Some(connection),
        })
    }

    /// Start a new connection; the reply is picked up by later receives.
    fn reconnect(&mut self) {
        let mut connection = match Connection::start(&self.socket_path, self.handshake_timeout) {
            Ok(connection) => connection,
            Err(e) => {
                debug!(error = %e, "LLDP daemon still unreachable");
                return;
            }
        };
        if let Err(e) = connection.read_reply() {
            debug!(error = %e, "LLDP subscription refused");
            return;
        }
        if connection.is_subscribed() {
            info!(path = %self.socket_path.display(), "Reconnected to LLDP daemon");
        } else {
            debug!(path = %self.socket_path.display(), "LLDP subscription sent, awaiting reply");
        }
        self.connection = Some(connection);
    }
}

impl Watcher for LldpClient {
    fn raw_fd(&self) -> Option<RawFd> {
        self.connection.as_ref().map(|c| c.stream.as_raw_fd())
    }

    fn wake_at(&self) -> Option<Instant> {
        self.connection.as_ref().and_then(Connection::deadline)
    }

    /// Drain and decode pending notifications, reconnecting first if closed.
    ///
    /// Transport failures close the connection instead of surfacing as errors.
    fn receive(&mut self) -> Result<Vec<LinkEvent>> {
        let Some(connection) = self.connection.as_mut() else {
            self.reconnect();
            return Ok(Vec::new());
        };

        if !connection.is_subscribed() {
            if let Err(e) = connection.read_reply() {
                warn!(error = %e, "LLDP subscription failed");
                self.mark_closed();
                return Ok(Vec::new());
            }
            if connection.is_subscribed() {
                info!(path = %self.socket_path.display(), "Reconnected to LLDP daemon");
            } else {
                if connection.deadline().is_some_and(|at| Instant::now() >= at) {
                    warn!("LLDP daemon did not answer the subscription in time");
                    self.mark_closed();
                }
                return Ok(Vec::new());
            }
        }

        let mut events = Vec::new();
        let mut close = false;
        match connection.drain() {
            Ok(Drain::Open) => {}
            Ok(Drain::Eof) => {
                warn!("LLDP daemon closed the connection");
                close = true;
            }
            Err(e) => {
                warn!(error = %e, "LLDP socket error");
                close = true;
            }
        }
        // Frames completed before a hangup are still delivered.
        if let Err(e) = connection.decode(&mut events) {
            warn!(error = %e, "LLDP protocol error");
            close = true;
        }
        if close {
            self.mark_closed();
        }
        Ok(events)
    }

    fn mark_closed(&mut self) {
        if self.connection.take().is_some() {
            debug!("LLDP connection marked closed, will reconnect lazily");
        }
    }
}
