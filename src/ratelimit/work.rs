//! Work items: the pending requests scheduled by the rate limiter.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::headers::RateLimitHeaders;
use super::route::Route;
use crate::error::{LimiterError, Result};
use crate::transport::{Exchange, Transport};

/// Back-off used by [`Work::handle`] when a 429 carries no delay.
const HANDLE_RETRY_AFTER: Duration = Duration::from_secs(1);

/// A pending request.
///
/// The limiter calls [`Work::execute`] once per attempt and reports the final
/// outcome through [`Work::complete`]. Retrying after a 429 is entirely the
/// bucket's job, so `execute` must perform exactly one exchange.
#[async_trait]
pub trait Work: Send + Sync {
    /// The route used to pick the bucket.
    fn route(&self) -> &Route;

    /// Perform one exchange.
    async fn execute(&self) -> Result<Exchange>;

    /// Deliver the terminal outcome. Only the first call has an effect.
    fn complete(&self, outcome: Result<Exchange>);

    /// Cancel the request.
    ///
    /// Safe to call at any time. An exchange already in flight is not
    /// interrupted, but it will not be retried.
    fn cancel(&self);

    /// Whether the request should be discarded without executing it.
    fn is_skipped(&self) -> bool;

    /// Whether the request reached its terminal outcome.
    fn is_done(&self) -> bool;

    /// Priority requests survive [`cancel_requests`](super::SequentialRateLimiter::cancel_requests).
    fn is_priority(&self) -> bool {
        false
    }

    /// Whether [`Work::cancel`] was called.
    fn is_cancelled(&self) -> bool;

    /// Whether a 429 should be retried by the bucket instead of surfaced.
    fn retries_on_rate_limit(&self) -> bool {
        true
    }

    /// Run the request directly, without going through a bucket.
    ///
    /// With `handle_on_rate_limit` set, a 429 is waited out and the request
    /// is sent again. Otherwise the 429 is returned as
    /// [`LimiterError::RateLimited`].
    ///
    /// No limiter is involved, so the delay is computed against the wall
    /// clock with relative resets rather than a configured [`Clock`].
    ///
    /// [`Clock`]: super::Clock
    async fn handle(&self, handle_on_rate_limit: bool) -> Result<Exchange> {
        loop {
            if self.is_cancelled() {
                return Err(LimiterError::Cancelled);
            }

            let exchange = self.execute().await?;
            if !exchange.is_rate_limited() {
                return Ok(exchange);
            }

            let now = Utc::now().timestamp_millis();
            let headers = RateLimitHeaders::parse(exchange.headers(), now, true);
            let retry_after =
                Duration::from_millis(headers.retry_after_millis(now, HANDLE_RETRY_AFTER) as u64);

            if !handle_on_rate_limit {
                return Err(LimiterError::RateLimited {
                    route: self.route().to_string(),
                    retry_after,
                });
            }

            debug!(
                route = %self.route(),
                retry_after_ms = retry_after.as_millis() as u64,
                "Rate limited, waiting before retrying"
            );
            tokio::time::sleep(retry_after).await;
        }
    }
}

type Responder = oneshot::Sender<Result<Exchange>>;

/// A plain HTTP call sent through a [`Transport`].
pub struct Request {
    route: Route,
    body: Option<Bytes>,
    transport: Arc<dyn Transport>,
    priority: bool,
    retry_on_rate_limit: bool,
    done: AtomicBool,
    cancelled: AtomicBool,
    responder: Mutex<Option<Responder>>,
}

impl Request {
    /// Create a request and the future that resolves to its outcome.
    pub fn new(route: Route, transport: Arc<dyn Transport>) -> (Self, PendingResponse) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            route,
            body: None,
            transport,
            priority: false,
            retry_on_rate_limit: true,
            done: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            responder: Mutex::new(Some(tx)),
        };
        (request, PendingResponse { rx })
    }

    /// Attach a request body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Exempt the request from bulk cancellation.
    pub fn with_priority(mut self, priority: bool) -> Self {
        self.priority = priority;
        self
    }

    /// Surface 429 responses instead of retrying them.
    pub fn without_rate_limit_retry(mut self) -> Self {
        self.retry_on_rate_limit = false;
        self
    }

    fn respond(&self, outcome: Result<Exchange>) {
        let responder = self.responder.lock().take();
        if let Some(tx) = responder {
            self.done.store(true, Ordering::SeqCst);
            // The caller may have stopped waiting; that is not an error.
            let _ = tx.send(outcome);
        }
    }
}

#[async_trait]
impl Work for Request {
    fn route(&self) -> &Route {
        &self.route
    }

    async fn execute(&self) -> Result<Exchange> {
        if self.is_skipped() {
            return Err(LimiterError::Cancelled);
        }
        self.transport.send(&self.route, self.body.clone()).await
    }

    fn complete(&self, outcome: Result<Exchange>) {
        if let Err(ref err) = outcome {
            if !matches!(err, LimiterError::Cancelled | LimiterError::Shutdown) {
                warn!(route = %self.route, error = %err, "Request failed");
            }
        }
        self.respond(outcome);
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.respond(Err(LimiterError::Cancelled));
        }
    }

    fn is_skipped(&self) -> bool {
        if self.is_cancelled() {
            return true;
        }
        // Nobody is waiting for the response anymore.
        self.responder
            .lock()
            .as_ref()
            .map_or(true, |tx| tx.is_closed())
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    fn is_priority(&self) -> bool {
        self.priority
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn retries_on_rate_limit(&self) -> bool {
        self.retry_on_rate_limit
    }
}

/// Resolves to the terminal outcome of a [`Request`].
#[derive(Debug)]
pub struct PendingResponse {
    rx: oneshot::Receiver<Result<Exchange>>,
}

impl Future for PendingResponse {
    type Output = Result<Exchange>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(Err(LimiterError::Cancelled)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::ScriptedTransport;
    use http::{Method, StatusCode};

    fn request(transport: &Arc<ScriptedTransport>) -> (Request, PendingResponse) {
        Request::new(Route::new(Method::GET, "/a"), transport.clone())
    }

    #[tokio::test]
    async fn test_complete_delivers_once() {
        let transport = Arc::new(ScriptedTransport::new());
        let (request, pending) = request(&transport);

        let exchange = request.execute().await.unwrap();
        request.complete(Ok(exchange));
        request.complete(Err(LimiterError::Cancelled));

        assert!(request.is_done());
        assert_eq!(pending.await.unwrap().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_cancel_resolves_pending() {
        let transport = Arc::new(ScriptedTransport::new());
        let (request, pending) = request(&transport);

        request.cancel();

        assert!(request.is_cancelled());
        assert!(request.is_skipped());
        assert!(matches!(pending.await, Err(LimiterError::Cancelled)));
        assert!(matches!(request.execute().await, Err(LimiterError::Cancelled)));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_receiver_skips() {
        let transport = Arc::new(ScriptedTransport::new());
        let (request, pending) = request(&transport);

        assert!(!request.is_skipped());
        drop(pending);
        assert!(request.is_skipped());
        assert!(!request.is_cancelled());
    }

    #[tokio::test]
    async fn test_builder_flags() {
        let transport = Arc::new(ScriptedTransport::new());
        let (request, _pending) = request(&transport);
        let request = request
            .with_priority(true)
            .with_body("payload")
            .without_rate_limit_retry();

        assert!(request.is_priority());
        assert!(!request.retries_on_rate_limit());
        assert_eq!(request.body.as_deref(), Some(&b"payload"[..]));
    }

    #[tokio::test]
    async fn test_handle_surfaces_rate_limit() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(429, &[("Retry-After", "2"), ("X-RateLimit-Global", "false")]);
        let (request, _pending) = request(&transport);

        let err = request.handle(false).await.unwrap_err();

        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        match err {
            LimiterError::RateLimited { route, .. } => assert_eq!(route, "GET /a"),
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_retries_rate_limit() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(429, &[("Retry-After", "1")]);
        transport.push(204, &[]);
        let (request, _pending) = request(&transport);

        let exchange = request.handle(true).await.unwrap();

        assert_eq!(exchange.status(), StatusCode::NO_CONTENT);
        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].at - calls[0].at >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_handle_returns_transport_failure() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_failure("connection reset");
        let (request, _pending) = request(&transport);

        let err = request.handle(true).await.unwrap_err();
        assert!(matches!(err, LimiterError::Transport { .. }));
    }
}
