//! Sequential rate limiter: routes work items to buckets and owns their
//! lifecycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, trace};

use super::backend::RestRateLimiter;
use super::bucket::Bucket;
use super::config::RateLimitConfig;
use super::route::Route;
use super::work::Work;
use crate::error::{LimiterError, Result};

type Callback = Box<dyn FnOnce() + Send>;

/// Lifecycle of the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterState {
    /// Accepting new work
    Running,
    /// Rejecting new work, queued work is still being processed
    Stopping,
    /// All buckets drained, stop callbacks have run
    Stopped,
}

/// Bucket map, hash table and lifecycle, guarded by one short-held lock.
struct Registry {
    /// Bucket id to bucket
    buckets: HashMap<String, Arc<Bucket>>,
    /// Route group to discovered bucket hash
    hashes: HashMap<String, String>,
    state: LimiterState,
    callbacks: Vec<Callback>,
}

impl Registry {
    /// Bucket id and hash new work for `route` is queued with.
    ///
    /// A provisional bucket that still holds work keeps receiving the route's
    /// work after another route of the group discovered the hash, so the
    /// queued items run first. It migrates on its own first hashed response.
    fn resolve(&self, route: &Route) -> (String, Option<String>) {
        let provisional = route.bucket_id(None);
        match self.hashes.get(&route.group_key()) {
            Some(hash)
                if !self
                    .buckets
                    .get(&provisional)
                    .is_some_and(|bucket| !bucket.is_idle()) =>
            {
                (route.bucket_id(Some(hash)), Some(hash.clone()))
            }
            _ => (provisional, None),
        }
    }
}

/// State shared between the limiter handle and its bucket workers.
pub(crate) struct Shared {
    config: RateLimitConfig,
    registry: Mutex<Registry>,
    stopped: AtomicBool,
    shutdown: AtomicBool,
}

impl Shared {
    pub(crate) fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub(crate) fn now(&self) -> i64 {
        self.config.clock().now_millis()
    }

    /// Whether `stop` was called with `shutdown` set.
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn spawn(self: &Arc<Self>, bucket: Arc<Bucket>) {
        trace!(bucket = %bucket.id(), "Scheduling bucket worker");
        self.config.scheduler().spawn(bucket.run(Arc::clone(self)));
    }

    /// Record the hash the remote reported for `route` and apply the
    /// response's window with `update`.
    ///
    /// A provisional bucket is merged into the bucket keyed by the hash and
    /// the target bucket is returned; `update` runs on the target before the
    /// queued work moves over. Known buckets only update the route mapping,
    /// so later work for the route goes to the new bucket.
    pub(crate) fn rebind<F>(
        self: &Arc<Self>,
        bucket: &Arc<Bucket>,
        route: &Route,
        hash: String,
        update: F,
    ) -> Option<Arc<Bucket>>
    where
        F: FnOnce(&Bucket),
    {
        let mut registry = self.registry.lock();
        let previous = registry.hashes.insert(route.group_key(), hash.clone());

        if !bucket.is_provisional() {
            update(&**bucket);
            if bucket.hash() != Some(hash.as_str()) && previous.as_deref() != Some(hash.as_str()) {
                debug!(
                    bucket = %bucket.id(),
                    route = %route,
                    hash = %hash,
                    "Bucket hash changed for route"
                );
            }
            return None;
        }

        let now = self.now();
        let id = route.bucket_id(Some(&hash));
        let target = registry
            .buckets
            .entry(id)
            .or_insert_with_key(|id| {
                debug!(bucket = %id, route = %route, "Creating bucket for discovered hash");
                Arc::new(Bucket::new(id.clone(), Some(hash.clone()), route.scope(), now))
            })
            .clone();

        let registered = registry
            .buckets
            .get(bucket.id())
            .is_some_and(|current| Arc::ptr_eq(current, bucket));
        if registered {
            registry.buckets.remove(bucket.id());
        }

        update(&*target);
        let moved = bucket.take_queue();
        debug!(
            from = %bucket.id(),
            to = %target.id(),
            moved = moved.len(),
            "Migrating provisional bucket"
        );
        if target.append(moved, now) {
            self.spawn(Arc::clone(&target));
        }
        Some(target)
    }

    /// Fire the stop callbacks once every bucket has drained.
    pub(crate) fn check_drained(&self) {
        let callbacks = {
            let mut registry = self.registry.lock();
            if registry.state != LimiterState::Stopping {
                return;
            }
            if !registry.buckets.values().all(|bucket| bucket.is_idle()) {
                return;
            }
            registry.state = LimiterState::Stopped;
            std::mem::take(&mut registry.callbacks)
        };

        info!("Rate limiter stopped, all buckets drained");
        for callback in callbacks {
            callback();
        }
    }

    /// Drop buckets that have been idle for longer than the idle timeout.
    pub(crate) fn sweep(&self) {
        let now = self.now();
        let idle_timeout = i64::try_from(self.config.idle_timeout().as_millis()).unwrap_or(i64::MAX);

        let mut registry = self.registry.lock();
        let before = registry.buckets.len();
        registry
            .buckets
            .retain(|_, bucket| !bucket.is_expired(now, idle_timeout));

        let removed = before - registry.buckets.len();
        if removed > 0 {
            debug!(removed, remaining = registry.buckets.len(), "Removed idle buckets");
        }
    }

    fn buckets(&self) -> Vec<Arc<Bucket>> {
        self.registry.lock().buckets.values().cloned().collect()
    }
}

/// Rate limiter that executes the requests of each bucket one at a time.
///
/// Requests are routed to buckets by their [`Route`]. Until the remote
/// reports a bucket hash for a route, its requests share a provisional bucket
/// keyed by the route template. Buckets run concurrently with each other on
/// the configured scheduler; within a bucket, requests run strictly in
/// submission order, and requests retried after a 429 go back to the front.
pub struct SequentialRateLimiter {
    shared: Arc<Shared>,
}

impl SequentialRateLimiter {
    /// Create a limiter and start its idle-bucket sweeper.
    pub fn new(config: RateLimitConfig) -> Self {
        let shared = Arc::new(Shared {
            config,
            registry: Mutex::new(Registry {
                buckets: HashMap::new(),
                hashes: HashMap::new(),
                state: LimiterState::Running,
                callbacks: Vec::new(),
            }),
            stopped: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });

        spawn_sweeper(&shared);
        Self { shared }
    }

    /// The configuration this limiter was created with.
    pub fn config(&self) -> &RateLimitConfig {
        &self.shared.config
    }

    /// Queue a work item on the bucket of its route.
    ///
    /// Never blocks. After [`stop`](Self::stop) the item is completed with
    /// [`LimiterError::Shutdown`] and the same error is returned.
    pub fn enqueue(&self, work: Arc<dyn Work>) -> Result<()> {
        let mut registry = self.shared.registry.lock();
        if registry.state != LimiterState::Running {
            drop(registry);
            debug!(route = %work.route(), "Rejecting request, rate limiter is stopped");
            work.complete(Err(LimiterError::Shutdown));
            return Err(LimiterError::Shutdown);
        }

        let now = self.shared.now();
        let route = work.route().clone();
        let (id, hash) = registry.resolve(&route);
        if hash.is_some() {
            // An idle provisional bucket has nothing left to hand over.
            registry.buckets.remove(&route.bucket_id(None));
        }
        let bucket = registry
            .buckets
            .entry(id)
            .or_insert_with_key(|id| {
                debug!(bucket = %id, route = %route, "Creating bucket");
                Arc::new(Bucket::new(id.clone(), hash.clone(), route.scope(), now))
            })
            .clone();

        trace!(bucket = %bucket.id(), route = %route, "Enqueued request");
        if bucket.enqueue(work, now) {
            self.shared.spawn(bucket);
        }
        Ok(())
    }

    /// Stop accepting new work.
    ///
    /// With `shutdown` set, every queued request that is not a priority
    /// request is cancelled. `callback` runs once all buckets have drained.
    pub fn stop<F>(&self, shutdown: bool, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut registry = self.shared.registry.lock();
            match registry.state {
                LimiterState::Stopped => {
                    drop(registry);
                    callback();
                    return;
                }
                LimiterState::Running => {
                    registry.state = LimiterState::Stopping;
                    self.shared.stopped.store(true, Ordering::SeqCst);
                    info!(shutdown, buckets = registry.buckets.len(), "Stopping rate limiter");
                }
                LimiterState::Stopping => {}
            }
            registry.callbacks.push(Box::new(callback));
        }

        if shutdown {
            self.shared.shutdown.store(true, Ordering::SeqCst);
            let cancelled = self.cancel_requests();
            info!(cancelled, "Cancelled queued requests for shutdown");
        }

        for bucket in self.shared.buckets() {
            bucket.wake();
        }
        self.shared.check_drained();
    }

    /// Whether the limiter stopped accepting new work.
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LimiterState {
        self.shared.registry.lock().state
    }

    /// Cancel every queued request that is not a priority request.
    ///
    /// Returns the number of cancelled requests.
    pub fn cancel_requests(&self) -> usize {
        let cancelled: usize = self
            .shared
            .buckets()
            .iter()
            .map(|bucket| bucket.cancel_requests())
            .sum();

        if cancelled > 0 {
            debug!(cancelled, "Cancelled queued requests");
        }
        cancelled
    }

    /// Number of buckets currently tracked.
    pub fn bucket_count(&self) -> usize {
        self.shared.registry.lock().buckets.len()
    }

    /// Number of queued requests across all buckets, excluding in-flight ones.
    pub fn queued(&self) -> usize {
        self.shared.buckets().iter().map(|bucket| bucket.queued()).sum()
    }

    /// Id of the bucket new work for `route` is queued on.
    pub fn bucket_id(&self, route: &Route) -> String {
        self.shared.registry.lock().resolve(route).0
    }

    /// Drop idle buckets now instead of waiting for the sweeper.
    pub fn sweep(&self) {
        self.shared.sweep();
    }
}

impl RestRateLimiter for SequentialRateLimiter {
    fn enqueue(&self, work: Arc<dyn Work>) -> Result<()> {
        SequentialRateLimiter::enqueue(self, work)
    }

    fn stop(&self, shutdown: bool, callback: Box<dyn FnOnce() + Send>) {
        SequentialRateLimiter::stop(self, shutdown, callback)
    }

    fn is_stopped(&self) -> bool {
        SequentialRateLimiter::is_stopped(self)
    }

    fn cancel_requests(&self) -> usize {
        SequentialRateLimiter::cancel_requests(self)
    }
}

impl std::fmt::Debug for SequentialRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequentialRateLimiter")
            .field("state", &self.state())
            .field("buckets", &self.bucket_count())
            .finish()
    }
}

/// Periodically sweep idle buckets until the limiter is dropped or stopped.
fn spawn_sweeper(shared: &Arc<Shared>) {
    let weak: Weak<Shared> = Arc::downgrade(shared);
    let period = shared.config.sweep_interval().max(Duration::from_millis(1));

    shared.config.scheduler().spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(shared) = weak.upgrade() else {
                break;
            };
            if shared.registry.lock().state == LimiterState::Stopped {
                break;
            }
            shared.sweep();
        }
    });
}
