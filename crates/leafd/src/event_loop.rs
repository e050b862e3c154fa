//! Event loop
//!
//! Single-threaded multiplex over the netlink watch socket and the LLDP
//! connection. Every wakeup drains the ready sources and feeds each event to
//! the reconciliation engine in order.

use crate::engine::Reconciler;
use crate::error::{LeafError, Result};
use crate::netlink_control::LinkControl;
use crate::types::LinkEvent;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// A pollable producer of `LinkEvent`s.
pub trait Watcher {
    /// Descriptor to wait on, `None` while the source is closed.
    fn raw_fd(&self) -> Option<RawFd>;

    /// Drain everything currently readable and decode it.
    fn receive(&mut self) -> Result<Vec<LinkEvent>>;

    /// When `receive()` is due even without readiness, e.g. a pending handshake deadline.
    fn wake_at(&self) -> Option<Instant> {
        None
    }

    /// Drop the underlying connection after a hangup or error.
    fn mark_closed(&mut self) {}
}

pub struct EventLoop<W, L, C> {
    watch: W,
    lldp: L,
    engine: Reconciler<C>,
    reconnect_interval: Duration,
    reconnect_at: Option<Instant>,
}

fn is_broken(flags: PollFlags) -> bool {
    flags.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL)
}

/// Millisecond poll timeout, rounded up so a wait never ends just short of its deadline.
pub(crate) fn timeout_for(remaining: Duration) -> PollTimeout {
    let millis = remaining.as_micros().div_ceil(1000);
    u16::try_from(millis)
        .map(PollTimeout::from)
        .unwrap_or(PollTimeout::MAX)
}

impl<W, L, C> EventLoop<W, L, C>
where
    W: Watcher,
    L: Watcher,
    C: LinkControl,
{
    pub fn new(watch: W, lldp: L, engine: Reconciler<C>, reconnect_interval: Duration) -> Self {
        Self {
            watch,
            lldp,
            engine,
            reconnect_interval,
            reconnect_at: None,
        }
    }

    pub fn engine(&self) -> &Reconciler<C> {
        &self.engine
    }

    /// Run until `shutdown` is set or the watch channel fails.
    ///
    /// The flag is checked once per iteration.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        info!(
            upstream = %self.engine.upstream().name(),
            leaves = %self.engine.leaves(),
            "Event loop started"
        );
        while !shutdown.load(Ordering::Relaxed) {
            self.run_once()?;
        }
        info!("Shutdown requested, leaving event loop");
        Ok(())
    }

    /// One wait and dispatch round.
    pub fn run_once(&mut self) -> Result<()> {
        let watch_fd = self
            .watch
            .raw_fd()
            .ok_or_else(|| LeafError::Netlink("Watch channel is closed".to_string()))?;
        let timeout = self.wait_timeout();
        let lldp_fd = self.lldp.raw_fd();

        let (watch_revents, lldp_revents) = {
            // SAFETY: both descriptors are owned by watchers that outlive this block.
            let mut fds = vec![PollFd::new(
                unsafe { BorrowedFd::borrow_raw(watch_fd) },
                PollFlags::POLLIN,
            )];
            if let Some(fd) = lldp_fd {
                fds.push(PollFd::new(
                    unsafe { BorrowedFd::borrow_raw(fd) },
                    PollFlags::POLLIN,
                ));
            }

            match poll(&mut fds, timeout) {
                Ok(_) => {}
                Err(Errno::EINTR) => {
                    trace!("Wait interrupted by signal");
                    return Ok(());
                }
                Err(e) => return Err(LeafError::Netlink(format!("poll failed: {}", e))),
            }
            let revents = |fd: &PollFd<'_>| fd.revents().unwrap_or(PollFlags::empty());
            (revents(&fds[0]), fds.get(1).map(revents))
        };

        if watch_revents.contains(PollFlags::POLLIN) {
            let events = self.watch.receive()?;
            self.dispatch(events);
        }
        if is_broken(watch_revents) {
            return Err(LeafError::Netlink(format!(
                "Watch channel failed ({:?})",
                watch_revents
            )));
        }

        if let Some(revents) = lldp_revents {
            if revents.contains(PollFlags::POLLIN) {
                self.drain_lldp();
            }
            if is_broken(revents) && self.lldp.raw_fd().is_some() {
                warn!(?revents, "LLDP connection hung up");
                self.lldp.mark_closed();
            }
        }

        self.retry_lldp_if_due();
        Ok(())
    }

    /// Block indefinitely while LLDP is up, otherwise until the next reconnect
    /// attempt or the LLDP handshake deadline.
    fn wait_timeout(&mut self) -> PollTimeout {
        let now = Instant::now();
        if self.lldp.raw_fd().is_some() {
            self.reconnect_at = None;
            return match self.lldp.wake_at() {
                Some(at) => timeout_for(at.saturating_duration_since(now)),
                None => PollTimeout::NONE,
            };
        }
        let at = *self
            .reconnect_at
            .get_or_insert(now + self.reconnect_interval);
        timeout_for(at.saturating_duration_since(now))
    }

    fn retry_lldp_if_due(&mut self) {
        if self.lldp.raw_fd().is_some() {
            if self.lldp.wake_at().is_some_and(|at| Instant::now() >= at) {
                trace!("LLDP deadline reached");
                self.drain_lldp();
            }
            return;
        }
        match self.reconnect_at {
            Some(at) if Instant::now() >= at => {
                self.reconnect_at = None;
                debug!("Retrying LLDP connection");
                self.drain_lldp();
            }
            _ => {}
        }
    }

    fn drain_lldp(&mut self) {
        match self.lldp.receive() {
            Ok(events) => self.dispatch(events),
            Err(e) => {
                warn!(error = %e, "LLDP receive failed");
                self.lldp.mark_closed();
            }
        }
    }

    fn dispatch(&mut self, events: Vec<LinkEvent>) {
        for event in &events {
            self.engine.handle(event);
        }
    }
}
