//! Rate limiter trait for abstracting over limiter implementations.

use std::sync::Arc;

use super::work::Work;
use crate::error::Result;

/// Trait for rate limiter implementations.
///
/// This trait lets callers hold a limiter as `Arc<dyn RestRateLimiter>`
/// without depending on how requests are scheduled.
pub trait RestRateLimiter: Send + Sync {
    /// Queue a work item. Never blocks.
    fn enqueue(&self, work: Arc<dyn Work>) -> Result<()>;

    /// Stop accepting work and run `callback` once all queued work drained.
    ///
    /// With `shutdown` set, queued non-priority work is cancelled first.
    fn stop(&self, shutdown: bool, callback: Box<dyn FnOnce() + Send>);

    /// Whether `stop` has been called. Queued work may still be draining.
    fn is_stopped(&self) -> bool;

    /// Cancel all queued non-priority work, returning how many were cancelled.
    fn cancel_requests(&self) -> usize;
}
