//! Per-route sequential execution units.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use super::global::GlobalRateLimit;
use super::headers::RateLimitHeaders;
use super::limiter::Shared;
use super::route::BucketScope;
use super::work::Work;
use crate::error::LimiterError;
use crate::transport::Exchange;

/// A queue of work items sharing one rate limit window.
///
/// At most one item of a bucket is in flight at any time, which keeps the
/// submission order and makes the window accounting exact.
pub(crate) struct Bucket {
    id: String,
    hash: Option<String>,
    scope: BucketScope,
    state: Mutex<BucketState>,
    wake: Notify,
}

struct BucketState {
    queue: VecDeque<Arc<dyn Work>>,
    limit: Option<u32>,
    remaining: u32,
    reset_at: i64,
    /// A worker task owns the queue
    running: bool,
    last_used: i64,
}

enum Next {
    Idle,
    Wait(Duration),
    Ready(Arc<dyn Work>),
}

impl Bucket {
    pub(crate) fn new(id: String, hash: Option<String>, scope: BucketScope, now: i64) -> Self {
        Self {
            id,
            hash,
            scope,
            state: Mutex::new(BucketState {
                queue: VecDeque::new(),
                limit: None,
                remaining: 1,
                reset_at: 0,
                running: false,
                last_used: now,
            }),
            wake: Notify::new(),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn hash(&self) -> Option<&str> {
        self.hash.as_deref()
    }

    /// Provisional buckets are keyed by route template until the remote
    /// reports the real bucket hash.
    pub(crate) fn is_provisional(&self) -> bool {
        self.hash.is_none()
    }

    /// Epoch millisecond until which the global limits block this bucket.
    fn global_reset(&self, global: &dyn GlobalRateLimit) -> i64 {
        match self.scope {
            BucketScope::Account => global.classic().max(global.cloudflare()),
            BucketScope::Edge => global.cloudflare(),
        }
    }

    /// Append a work item. Returns `true` if a worker has to be started.
    pub(crate) fn enqueue(&self, work: Arc<dyn Work>, now: i64) -> bool {
        let mut state = self.state.lock();
        state.queue.push_back(work);
        state.last_used = now;
        !std::mem::replace(&mut state.running, true)
    }

    /// Append work moved over from another bucket.
    /// Returns `true` if a worker has to be started.
    pub(crate) fn append(&self, work: VecDeque<Arc<dyn Work>>, now: i64) -> bool {
        if work.is_empty() {
            return false;
        }
        let mut state = self.state.lock();
        state.queue.extend(work);
        state.last_used = now;
        !std::mem::replace(&mut state.running, true)
    }

    /// Put a rate limited item back at the head of the queue.
    fn retry(&self, work: Arc<dyn Work>) {
        self.state.lock().queue.push_front(work);
    }

    fn pop_front(&self) -> Option<Arc<dyn Work>> {
        self.state.lock().queue.pop_front()
    }

    /// Release the bucket after its worker ended abnormally.
    /// Returns `true` if queued work needs a new worker.
    fn release(&self) -> bool {
        let mut state = self.state.lock();
        state.running = !state.queue.is_empty();
        state.running
    }

    /// Remove all queued work, leaving the bucket without a worker.
    pub(crate) fn take_queue(&self) -> VecDeque<Arc<dyn Work>> {
        let mut state = self.state.lock();
        state.running = false;
        std::mem::take(&mut state.queue)
    }

    /// Cancel every queued item that is not a priority item.
    ///
    /// Returns how many items were cancelled by this call.
    pub(crate) fn cancel_requests(&self) -> usize {
        let cancelled: VecDeque<Arc<dyn Work>> = {
            let mut state = self.state.lock();
            let (keep, cancel): (VecDeque<_>, VecDeque<_>) =
                state.queue.drain(..).partition(|work| work.is_priority());
            state.queue = keep;
            cancel
        };

        let mut count = 0;
        for work in cancelled {
            if !work.is_cancelled() {
                work.cancel();
                count += 1;
            }
        }
        if count > 0 {
            trace!(bucket = %self.id, cancelled = count, "Cancelled queued requests");
        }
        self.wake();
        count
    }

    /// Make a waiting worker re-evaluate its queue.
    pub(crate) fn wake(&self) {
        self.wake.notify_one();
    }

    pub(crate) fn is_idle(&self) -> bool {
        let state = self.state.lock();
        !state.running && state.queue.is_empty()
    }

    /// Whether the bucket can be dropped without losing rate limit state.
    pub(crate) fn is_expired(&self, now: i64, idle_timeout: i64) -> bool {
        let state = self.state.lock();
        !state.running
            && state.queue.is_empty()
            && state.reset_at <= now
            && now - state.last_used >= idle_timeout
    }

    pub(crate) fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    #[cfg(test)]
    pub(crate) fn remaining(&self) -> u32 {
        self.state.lock().remaining
    }

    /// Apply the window reported by a successful response.
    fn record_success(&self, headers: &RateLimitHeaders) {
        let mut state = self.state.lock();
        state.remaining = state.remaining.saturating_sub(1);
        if let Some(limit) = headers.limit {
            state.limit = Some(limit);
        }
        if let Some(remaining) = headers.remaining {
            state.remaining = remaining;
        }
        if let Some(reset_at) = headers.reset_at {
            state.reset_at = reset_at;
        }
    }

    /// Exhaust the window until `until`.
    fn back_off(&self, until: i64, headers: &RateLimitHeaders) {
        let mut state = self.state.lock();
        if let Some(limit) = headers.limit {
            state.limit = Some(limit);
        }
        state.remaining = 0;
        state.reset_at = state.reset_at.max(until);
    }

    /// Pick the next item to execute, discarding skipped ones.
    fn next(&self, global: &dyn GlobalRateLimit, now: i64) -> Next {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        loop {
            match state.queue.front() {
                None => {
                    state.running = false;
                    return Next::Idle;
                }
                Some(head) if head.is_skipped() || head.is_cancelled() => {}
                Some(_) => break,
            }
            if let Some(discarded) = state.queue.pop_front() {
                trace!(bucket = %self.id, route = %discarded.route(), "Discarding skipped request");
            }
        }

        if state.remaining == 0 && state.reset_at <= now {
            state.remaining = state.limit.unwrap_or(1).max(1);
        }

        let global_wait = self.global_reset(global).saturating_sub(now);
        let local_wait = if state.remaining == 0 {
            state.reset_at.saturating_sub(now)
        } else {
            0
        };
        let wait = global_wait.max(local_wait);
        if wait > 0 {
            return Next::Wait(Duration::from_millis(wait as u64));
        }

        match state.queue.pop_front() {
            Some(work) => {
                state.last_used = now;
                Next::Ready(work)
            }
            None => {
                state.running = false;
                Next::Idle
            }
        }
    }

    /// Worker loop. Runs until the queue is empty or the bucket has been
    /// merged into the one keyed by its discovered hash.
    pub(crate) async fn run(self: Arc<Self>, shared: Arc<Shared>) {
        debug!(bucket = %self.id, "Bucket worker started");
        let mut guard = WorkerGuard {
            bucket: Arc::clone(&self),
            shared: Arc::clone(&shared),
            in_flight: None,
            finished: false,
        };

        loop {
            let now = shared.now();
            match self.next(shared.config().global_rate_limit().as_ref(), now) {
                Next::Idle => break,
                Next::Wait(delay) => {
                    trace!(
                        bucket = %self.id,
                        delay_ms = delay.as_millis() as u64,
                        "Waiting for rate limit reset"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.wake.notified() => {}
                    }
                }
                Next::Ready(work) => {
                    guard.in_flight = Some(Arc::clone(&work));
                    let migrated = self.dispatch(&shared, work).await;
                    guard.in_flight = None;
                    if migrated {
                        debug!(bucket = %self.id, "Provisional bucket retired");
                        break;
                    }
                }
            }
        }

        guard.finished = true;
        debug!(bucket = %self.id, "Bucket worker idle");
    }

    /// Execute one item and apply its response.
    ///
    /// Returns `true` if this bucket was merged into another one.
    async fn dispatch(self: &Arc<Self>, shared: &Arc<Shared>, work: Arc<dyn Work>) -> bool {
        let route = work.route().clone();
        trace!(bucket = %self.id, route = %route, "Executing request");

        let task = Arc::clone(&work);
        let outcome = match shared
            .config()
            .elastic()
            .spawn(async move { task.execute().await })
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => Err(LimiterError::Transport {
                route: route.to_string(),
                message: format!("exchange task failed: {}", err),
            }),
        };

        let exchange: Exchange = match outcome {
            Ok(exchange) => exchange,
            Err(err) => {
                work.complete(Err(err));
                return false;
            }
        };

        let now = shared.now();
        let config = shared.config();
        let headers = RateLimitHeaders::parse(exchange.headers(), now, config.is_relative());
        let rate_limited = exchange.is_rate_limited();
        let mut local_back_off = None;

        if rate_limited {
            let retry_after = headers.retry_after_millis(now, config.default_retry_after());
            let until = now.saturating_add(retry_after);
            let global = config.global_rate_limit();

            if headers.global {
                warn!(bucket = %self.id, route = %route, retry_after_ms = retry_after, "Hit the global rate limit");
                global.set_classic(until);
            } else if headers.is_edge_block() {
                warn!(bucket = %self.id, route = %route, retry_after_ms = retry_after, "Hit an edge rate limit");
                global.set_cloudflare(until);
            } else {
                warn!(
                    bucket = %self.id,
                    route = %route,
                    retry_after_ms = retry_after,
                    scope = ?headers.scope,
                    "Hit the bucket rate limit"
                );
                local_back_off = Some(until);
            }

            if work.is_cancelled() {
                trace!(bucket = %self.id, route = %route, "Not retrying cancelled request");
            } else if !work.retries_on_rate_limit() {
                work.complete(Err(LimiterError::RateLimited {
                    route: route.to_string(),
                    retry_after: Duration::from_millis(retry_after as u64),
                }));
            } else if shared.is_shutting_down() && !work.is_priority() {
                work.cancel();
            } else {
                self.retry(Arc::clone(&work));
            }
        }

        let update = |bucket: &Bucket| match local_back_off {
            Some(until) => bucket.back_off(until, &headers),
            None if !rate_limited => bucket.record_success(&headers),
            None => {}
        };
        let migrated = match headers.bucket.clone() {
            Some(hash) => shared.rebind(self, &route, hash, update).is_some(),
            None => {
                update(&**self);
                false
            }
        };

        if !rate_limited {
            work.complete(Ok(exchange));
        }
        migrated
    }
}

/// Keeps a bucket usable when its worker task panics, for example in a
/// [`Work`] implementation. A worker dropped along with its runtime is left
/// alone.
struct WorkerGuard {
    bucket: Arc<Bucket>,
    shared: Arc<Shared>,
    in_flight: Option<Arc<dyn Work>>,
    finished: bool,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        if !self.finished && std::thread::panicking() {
            warn!(bucket = %self.bucket.id, "Bucket worker panicked");

            // The item being handled when the worker died, or the head item
            // if it died while picking one.
            let orphan = self.in_flight.take().or_else(|| self.bucket.pop_front());
            if let Some(work) = orphan {
                work.complete(Err(LimiterError::Transport {
                    route: work.route().to_string(),
                    message: "bucket worker panicked".to_string(),
                }));
            }

            if self.bucket.release() {
                self.shared.spawn(Arc::clone(&self.bucket));
            }
        }
        self.shared.check_drained();
    }
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("id", &self.id)
            .field("scope", &self.scope)
            .field("queued", &self.queued())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::global::AtomicGlobalRateLimit;
    use crate::ratelimit::route::Route;
    use crate::ratelimit::work::Request;
    use crate::transport::mock::{header_map, ScriptedTransport};
    use http::Method;

    const NOW: i64 = 1_000_000;

    fn work(path: &str, priority: bool) -> Arc<dyn Work> {
        let transport = Arc::new(ScriptedTransport::new());
        let (request, pending) = Request::new(Route::new(Method::GET, path), transport);
        // Keep the receiver alive so the request is not skipped.
        std::mem::forget(pending);
        Arc::new(request.with_priority(priority))
    }

    fn bucket(scope: BucketScope) -> Bucket {
        Bucket::new("b".to_string(), None, scope, NOW)
    }

    #[test]
    fn test_enqueue_reports_worker_start_once() {
        let bucket = bucket(BucketScope::Account);
        assert!(bucket.enqueue(work("/a", false), NOW));
        assert!(!bucket.enqueue(work("/a", false), NOW));
        assert_eq!(bucket.queued(), 2);
    }

    #[test]
    fn test_next_respects_global_scopes() {
        let global = AtomicGlobalRateLimit::new();
        global.set_classic(NOW + 500);

        let account = bucket(BucketScope::Account);
        account.enqueue(work("/a", false), NOW);
        assert!(matches!(account.next(&global, NOW), Next::Wait(d) if d == Duration::from_millis(500)));

        let edge = bucket(BucketScope::Edge);
        edge.enqueue(work("/a", false), NOW);
        assert!(matches!(edge.next(&global, NOW), Next::Ready(_)));

        global.set_cloudflare(NOW + 800);
        account.enqueue(work("/a", false), NOW);
        assert!(matches!(account.next(&global, NOW), Next::Wait(d) if d == Duration::from_millis(800)));
    }

    #[test]
    fn test_next_waits_for_exhausted_window() {
        let global = AtomicGlobalRateLimit::new();
        let bucket = bucket(BucketScope::Account);
        bucket.back_off(NOW + 1000, &RateLimitHeaders::default());
        bucket.enqueue(work("/a", false), NOW);

        assert!(matches!(bucket.next(&global, NOW), Next::Wait(d) if d == Duration::from_secs(1)));
        assert!(matches!(bucket.next(&global, NOW + 1000), Next::Ready(_)));
        assert_eq!(bucket.remaining(), 1);
    }

    #[test]
    fn test_next_discards_cancelled_and_goes_idle() {
        let global = AtomicGlobalRateLimit::new();
        let bucket = bucket(BucketScope::Account);
        let first = work("/a", false);
        bucket.enqueue(first.clone(), NOW);
        first.cancel();

        assert!(matches!(bucket.next(&global, NOW), Next::Idle));
        assert!(bucket.is_idle());
    }

    #[test]
    fn test_record_success_never_goes_negative() {
        let bucket = bucket(BucketScope::Account);
        let headers = RateLimitHeaders::default();

        bucket.record_success(&headers);
        bucket.record_success(&headers);
        assert_eq!(bucket.remaining(), 0);

        let headers = RateLimitHeaders::parse(
            &header_map(&[("X-RateLimit-Remaining", "4"), ("X-RateLimit-Limit", "5")]),
            NOW,
            true,
        );
        bucket.record_success(&headers);
        assert_eq!(bucket.remaining(), 4);
    }

    #[test]
    fn test_cancel_requests_keeps_priority() {
        let bucket = bucket(BucketScope::Account);
        bucket.enqueue(work("/1", false), NOW);
        bucket.enqueue(work("/2", true), NOW);
        bucket.enqueue(work("/3", false), NOW);

        assert_eq!(bucket.cancel_requests(), 2);
        assert_eq!(bucket.queued(), 1);
        assert_eq!(bucket.cancel_requests(), 0);
    }

    #[test]
    fn test_expiry() {
        let bucket = bucket(BucketScope::Account);
        assert!(!bucket.is_expired(NOW + 10, 60));
        assert!(bucket.is_expired(NOW + 60, 60));

        bucket.back_off(NOW + 500, &RateLimitHeaders::default());
        assert!(!bucket.is_expired(NOW + 100, 60));
    }
}
