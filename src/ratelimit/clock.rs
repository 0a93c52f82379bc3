//! Time source for rate limit decisions.

use chrono::Utc;
use tokio::time::Instant;

/// Source of the current time in unix epoch milliseconds.
pub trait Clock: Send + Sync {
    /// Current time in epoch milliseconds.
    fn now_millis(&self) -> i64;
}

/// Wall clock anchored once and advanced with the monotonic tokio clock.
///
/// Reset timestamps reported by the remote are absolute, so the anchor is the
/// wall clock; elapsed time comes from [`Instant`] so that the clock never
/// jumps backwards and follows paused time in tests.
#[derive(Debug, Clone)]
pub struct SystemClock {
    epoch_anchor: i64,
    instant_anchor: Instant,
}

impl SystemClock {
    /// Create a clock anchored at the current wall-clock time.
    pub fn new() -> Self {
        Self {
            epoch_anchor: Utc::now().timestamp_millis(),
            instant_anchor: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        let elapsed = self.instant_anchor.elapsed().as_millis() as i64;
        self.epoch_anchor + elapsed
    }
}
