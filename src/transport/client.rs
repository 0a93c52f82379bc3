//! Plain HTTP/1 transport built on hyper.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::trace;

use super::{Exchange, Transport};
use crate::config::ClientSettings;
use crate::error::{LimiterError, Result};
use crate::ratelimit::Route;

/// [`Transport`] that sends routes to a fixed base URL.
///
/// Each exchange, including reading the body, is bounded by the configured
/// timeout.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client<HttpConnector, Full<Bytes>>,
    base_url: String,
    timeout: Duration,
}

impl HttpTransport {
    /// Create a transport for the given base URL.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            base_url,
            timeout,
        }
    }

    /// Create a transport from client settings.
    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self::new(settings.base_url.clone(), settings.timeout())
    }

    fn url(&self, route: &Route) -> String {
        format!("{}{}", self.base_url, route.path())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, route: &Route, body: Option<Bytes>) -> Result<Exchange> {
        let failure = |message: String| LimiterError::Transport {
            route: route.to_string(),
            message,
        };

        let request = http::Request::builder()
            .method(route.method().clone())
            .uri(self.url(route))
            .body(Full::new(body.unwrap_or_default()))
            .map_err(|e| failure(e.to_string()))?;

        trace!(route = %route, uri = %request.uri(), "Sending request");

        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| failure(e.to_string()))?;
            let (parts, body) = response.into_parts();
            let body = body
                .collect()
                .await
                .map_err(|e| failure(e.to_string()))?
                .to_bytes();
            Ok::<_, LimiterError>(Exchange::new(parts.status, parts.headers, body))
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| failure(format!("timed out after {}ms", self.timeout.as_millis())))?
    }
}
