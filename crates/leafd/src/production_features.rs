//! Production features for leafd
//!
//! systemd readiness and status notifications.

use crate::error::{LeafError, Result};
use tracing::{debug, info};

/// Systemd notification for notify-on-ready
///
/// Enabled when run under systemd with Type=notify; every call is a no-op
/// otherwise.
#[derive(Clone, Debug)]
pub struct SystemdNotifier {
    /// Is systemd socket available (NOTIFY_SOCKET env var set)?
    enabled: bool,
}

impl SystemdNotifier {
    pub fn new() -> Self {
        let enabled = std::env::var_os("NOTIFY_SOCKET").is_some();
        if enabled {
            debug!("Systemd notification socket detected");
        }
        Self { enabled }
    }

    fn send(&self, state: sd_notify::NotifyState<'_>, what: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        // Keep NOTIFY_SOCKET so later notifications still reach systemd.
        sd_notify::notify(false, &[state]).map_err(|e| {
            LeafError::Daemon(format!("Failed to send {} notification: {}", what, e))
        })
    }

    /// Event loop is armed; leaf state is being enforced.
    pub fn notify_ready(&self) -> Result<()> {
        self.send(sd_notify::NotifyState::Ready, "READY")?;
        if self.enabled {
            info!("Sent READY notification to systemd");
        }
        Ok(())
    }

    pub fn notify_stopping(&self) -> Result<()> {
        self.send(sd_notify::NotifyState::Stopping, "STOPPING")
    }

    /// Free-form status line shown by `systemctl status`.
    pub fn notify_status(&self, message: &str) -> Result<()> {
        debug!(status = message, "Service status");
        self.send(sd_notify::NotifyState::Status(message), "STATUS")
    }
}

impl Default for SystemdNotifier {
    fn default() -> Self {
        Self::new()
    }
}
