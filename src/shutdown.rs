//! Cooperative cancellation for the collection loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::info;

/// Granularity at which [`ShutdownToken::sleep`] re-checks the flag.
pub const SLEEP_STEP: Duration = Duration::from_millis(100);

/// Shared flag set once when the process is asked to stop.
///
/// Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    cancelled: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Cancels this token on SIGINT or SIGTERM.
    pub fn install_signal_handler(&self) -> Result<(), ctrlc::Error> {
        let token = self.clone();
        ctrlc::set_handler(move || {
            info!("Received shutdown signal");
            token.cancel();
        })
    }

    /// Sleeps up to `duration` in small steps, returning early on cancel.
    ///
    /// Returns `true` if the full duration elapsed without cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        let mut remaining = duration;
        while remaining > Duration::ZERO && !self.is_cancelled() {
            let step = remaining.min(SLEEP_STEP);
            std::thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
        !self.is_cancelled()
    }
}
