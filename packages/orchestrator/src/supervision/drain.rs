//! In-flight tracking with a bounded drain wait.
//!
//! Grounded on the same pattern the network layer uses for graceful HTTP
//! shutdown: an atomic in-flight counter with an RAII guard, polled against
//! a deadline. Here it tracks in-flight vbucket transitions inside
//! [`crate::cluster::mover`] so cancellation (§5) and the post-sync
//! eject-delay wait (§4.5 step 8) can both wait for "nothing moving right
//! now" without a condvar.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Tracks a count of in-flight units of work.
#[derive(Debug, Clone, Default)]
pub struct DrainTracker {
    in_flight: Arc<AtomicU64>,
}

impl DrainTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an RAII guard that counts one in-flight unit until dropped.
    #[must_use]
    pub fn guard(&self) -> DrainGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        DrainGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Polls until the in-flight count reaches zero or `timeout` elapses.
    /// Returns `true` on a clean drain, `false` on timeout.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// RAII guard decrementing the tracker's in-flight count on drop.
#[derive(Debug)]
pub struct DrainGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
