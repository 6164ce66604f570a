//! Trailing-edge debounce over a coalescing change signal.

use settingsync_storage::ChangeNotifier;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// A burst never postpones a flush past this many quiet periods.
pub const MAX_WAIT_FACTOR: u32 = 10;

pub struct Debouncer {
    notifier: ChangeNotifier,
    quiet: Duration,
    max_wait: Duration,
}

impl Debouncer {
    pub fn new(notifier: ChangeNotifier, quiet: Duration) -> Self {
        Self {
            notifier,
            quiet,
            max_wait: quiet.saturating_mul(MAX_WAIT_FACTOR),
        }
    }

    /// Waits for a change followed by `quiet` with no further changes, or
    /// at most `MAX_WAIT_FACTOR` quiet periods after the first change.
    ///
    /// Returns `false` once `cancel` turns true or its sender is gone.
    pub async fn settled(&self, cancel: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            biased;
            _ = cancelled(cancel) => return false,
            _ = self.notifier.changed() => {}
        }

        let deadline = Instant::now() + self.max_wait;
        loop {
            tokio::select! {
                biased;
                _ = cancelled(cancel) => return false,
                _ = tokio::time::sleep_until(deadline) => return true,
                _ = self.notifier.changed() => continue,
                _ = tokio::time::sleep(self.quiet) => return true,
            }
        }
    }

    /// Drops a signal that arrived but was never consumed.
    pub async fn discard_pending(&self) {
        let _ = tokio::time::timeout(Duration::ZERO, self.notifier.changed()).await;
    }
}

/// Resolves once the cancel flag is set or its sender is dropped.
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|stop| *stop).await;
}
