//! Global rate limit store.

use std::sync::atomic::{AtomicI64, Ordering};

/// Value used when no global limit is active.
pub const NO_LIMIT: i64 = -1;

/// Process-wide rate limit state shared by every bucket.
///
/// Both timestamps are unix epoch milliseconds at which the limit expires.
/// The two fields are independent of each other. Implementations may share
/// the state between several limiter instances.
pub trait GlobalRateLimit: Send + Sync {
    /// Reset time of the account-level (token) rate limit.
    fn classic(&self) -> i64;

    /// Set the reset time of the account-level rate limit.
    fn set_classic(&self, timestamp: i64);

    /// Reset time of the edge-level (IP) rate limit.
    fn cloudflare(&self) -> i64;

    /// Set the reset time of the edge-level rate limit.
    fn set_cloudflare(&self, timestamp: i64);
}

/// Default in-memory [`GlobalRateLimit`] backed by atomics.
#[derive(Debug)]
pub struct AtomicGlobalRateLimit {
    classic: AtomicI64,
    cloudflare: AtomicI64,
}

impl AtomicGlobalRateLimit {
    /// Create a store with no active limits.
    pub fn new() -> Self {
        Self {
            classic: AtomicI64::new(NO_LIMIT),
            cloudflare: AtomicI64::new(NO_LIMIT),
        }
    }
}

impl Default for AtomicGlobalRateLimit {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalRateLimit for AtomicGlobalRateLimit {
    fn classic(&self) -> i64 {
        self.classic.load(Ordering::SeqCst)
    }

    fn set_classic(&self, timestamp: i64) {
        self.classic.store(timestamp, Ordering::SeqCst);
    }

    fn cloudflare(&self) -> i64 {
        self.cloudflare.load(Ordering::SeqCst)
    }

    fn set_cloudflare(&self, timestamp: i64) {
        self.cloudflare.store(timestamp, Ordering::SeqCst);
    }
}
