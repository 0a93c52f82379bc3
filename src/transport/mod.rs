//! HTTP transport used by work items to perform their exchange.

mod client;
#[cfg(test)]
pub(crate) mod mock;

pub use client::HttpTransport;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};

use crate::error::Result;
use crate::ratelimit::Route;

/// A completed request/response exchange.
#[derive(Debug, Clone)]
pub struct Exchange {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Exchange {
    /// Create a new exchange result.
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// The response status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The response body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Whether the remote answered with `429 Too Many Requests`.
    pub fn is_rate_limited(&self) -> bool {
        self.status == StatusCode::TOO_MANY_REQUESTS
    }
}

/// Performs a single network exchange for a route.
///
/// Implementations must not retry; retries belong to the bucket.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for its response.
    async fn send(&self, route: &Route, body: Option<Bytes>) -> Result<Exchange>;
}
