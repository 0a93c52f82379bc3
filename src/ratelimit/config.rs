//! Runtime configuration for the rate limiter.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;

use super::clock::{Clock, SystemClock};
use super::global::{AtomicGlobalRateLimit, GlobalRateLimit};
use crate::config::LimiterSettings;

/// Everything a [`SequentialRateLimiter`](super::SequentialRateLimiter) needs
/// to run: where to schedule bucket workers, where to run exchanges, and the
/// shared global state.
#[derive(Clone)]
pub struct RateLimitConfig {
    scheduler: Handle,
    elastic: Handle,
    global: Arc<dyn GlobalRateLimit>,
    clock: Arc<dyn Clock>,
    relative: bool,
    idle_timeout: Duration,
    sweep_interval: Duration,
    default_retry_after: Duration,
}

impl RateLimitConfig {
    /// Create a configuration that runs everything on `scheduler`.
    pub fn new(scheduler: Handle, global: Arc<dyn GlobalRateLimit>, relative: bool) -> Self {
        let settings = LimiterSettings::default();
        Self {
            elastic: scheduler.clone(),
            scheduler,
            global,
            clock: Arc::new(SystemClock::new()),
            relative,
            idle_timeout: settings.bucket_idle_timeout(),
            sweep_interval: settings.sweep_interval(),
            default_retry_after: settings.default_retry_after(),
        }
    }

    /// Create a configuration from file settings with a fresh global store.
    pub fn from_settings(scheduler: Handle, settings: &LimiterSettings) -> Self {
        Self::new(
            scheduler,
            Arc::new(AtomicGlobalRateLimit::new()),
            settings.relative_reset,
        )
        .with_idle_timeout(settings.bucket_idle_timeout())
        .with_sweep_interval(settings.sweep_interval())
        .with_default_retry_after(settings.default_retry_after())
    }

    /// Run exchanges on a separate runtime.
    pub fn with_elastic(mut self, elastic: Handle) -> Self {
        self.elastic = elastic;
        self
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set how long an empty bucket is kept around.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Set how often idle buckets are swept.
    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    /// Set the back-off used for a 429 without any delay information.
    pub fn with_default_retry_after(mut self, retry_after: Duration) -> Self {
        self.default_retry_after = retry_after;
        self
    }

    /// The runtime bucket workers and delayed retries are scheduled on.
    pub fn scheduler(&self) -> &Handle {
        &self.scheduler
    }

    /// The runtime exchanges are executed on.
    ///
    /// This may be the same runtime as [`RateLimitConfig::scheduler`].
    pub fn elastic(&self) -> &Handle {
        &self.elastic
    }

    /// The global rate limit store.
    pub fn global_rate_limit(&self) -> &Arc<dyn GlobalRateLimit> {
        &self.global
    }

    /// The time source.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Whether to use `X-RateLimit-Reset-After` instead of `X-RateLimit-Reset`.
    pub fn is_relative(&self) -> bool {
        self.relative
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    pub fn default_retry_after(&self) -> Duration {
        self.default_retry_after
    }
}

impl fmt::Debug for RateLimitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitConfig")
            .field("relative", &self.relative)
            .field("idle_timeout", &self.idle_timeout)
            .field("sweep_interval", &self.sweep_interval)
            .field("default_retry_after", &self.default_retry_after)
            .finish_non_exhaustive()
    }
}
