//! Process-wide "light node is mid-restart" flag.
//!
//! Whoever performs a disruptive operation against the node flips the flag;
//! the router refuses to forward while it is set and session health ticks
//! warn clients about it. The coordinator has no idea why a restart happens.

use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Upper bound for [`RestartCoordinator::settled`] waits.
pub const MAX_SETTLE_GRACE: Duration = Duration::from_secs(5);

/// Shared restart flag.
#[derive(Debug)]
pub struct RestartCoordinator {
    flag: watch::Sender<bool>,
}

impl Default for RestartCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl RestartCoordinator {
    pub fn new() -> Self {
        Self {
            flag: watch::channel(false).0,
        }
    }

    /// Overwrite the flag.
    pub fn set_restarting(&self, restarting: bool) {
        let previous = self.flag.send_replace(restarting);
        if previous != restarting {
            info!(restarting, "light node restart flag changed");
        }
    }

    /// Current value of the flag.
    pub fn is_restarting(&self) -> bool {
        *self.flag.borrow()
    }

    /// Set the flag for the lifetime of the returned guard.
    ///
    /// The flag is cleared on drop, however the guarded operation ends.
    pub fn begin(&self) -> RestartGuard<'_> {
        self.set_restarting(true);
        RestartGuard { coordinator: self }
    }

    /// Debounced read: if a restart is in progress, wait up to `grace`
    /// (capped at [`MAX_SETTLE_GRACE`]) for it to finish, then report the flag.
    pub async fn settled(&self, grace: Duration) -> bool {
        if !self.is_restarting() {
            return false;
        }
        let mut rx = self.flag.subscribe();
        let grace = grace.min(MAX_SETTLE_GRACE);
        let _ = tokio::time::timeout(grace, rx.wait_for(|restarting| !*restarting)).await;
        self.is_restarting()
    }
}

/// Clears the restart flag when dropped.
#[must_use = "the restart flag is cleared as soon as the guard is dropped"]
pub struct RestartGuard<'a> {
    coordinator: &'a RestartCoordinator,
}

impl Drop for RestartGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.set_restarting(false);
    }
}
