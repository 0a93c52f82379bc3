//! Scripted transport for tests.

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{Exchange, Transport};
use crate::error::{LimiterError, Result};
use crate::ratelimit::Route;

/// One recorded call.
#[derive(Debug, Clone)]
pub(crate) struct Call {
    pub(crate) path: String,
    pub(crate) at: Instant,
}

/// Replays queued responses in order and answers `200 OK` once the script
/// runs out.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    script: Mutex<VecDeque<Result<Exchange>>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, status: u16, headers: &[(&str, &str)]) {
        self.script.lock().push_back(Ok(exchange(status, headers)));
    }

    pub(crate) fn push_failure(&self, message: &str) {
        self.script.lock().push_back(Err(LimiterError::Transport {
            route: String::new(),
            message: message.to_string(),
        }));
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub(crate) fn paths(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.path.clone()).collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, route: &Route, _body: Option<Bytes>) -> Result<Exchange> {
        self.calls.lock().push(Call {
            path: route.path().to_string(),
            at: Instant::now(),
        });
        let next = self.script.lock().pop_front();
        match next {
            Some(Err(LimiterError::Transport { message, .. })) => Err(LimiterError::Transport {
                route: route.to_string(),
                message,
            }),
            Some(result) => result,
            None => Ok(exchange(200, &[])),
        }
    }
}

pub(crate) fn exchange(status: u16, headers: &[(&str, &str)]) -> Exchange {
    Exchange::new(
        StatusCode::from_u16(status).unwrap(),
        header_map(headers),
        Bytes::new(),
    )
}

pub(crate) fn header_map(headers: &[(&str, &str)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    map
}
