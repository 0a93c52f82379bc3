//! Error types for the rate limiter.

use std::time::Duration;

use thiserror::Error;

/// Main error type for rate limiter operations.
///
/// Every work item ends in exactly one outcome; the failing ones are
/// reported through this enum.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// A `429 Too Many Requests` response that the caller asked to see
    /// instead of having it retried.
    #[error("The request was rate limited! Retry-After: {}ms Route: {route}", retry_after.as_millis())]
    RateLimited {
        /// The route whose bucket (or the global limit) was exhausted
        route: String,
        /// Back-off that should be respected before querying the route again
        retry_after: Duration,
    },

    /// Network or I/O failure while performing the exchange
    #[error("Transport error on {route}: {message}")]
    Transport {
        /// The route being requested
        route: String,
        /// Description of the failure
        message: String,
    },

    /// The request was cancelled before it completed
    #[error("Request was cancelled")]
    Cancelled,

    /// The limiter no longer accepts requests
    #[error("Rate limiter has been stopped")]
    Shutdown,

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LimiterError {
    /// Whether this error is a surfaced rate limit.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, LimiterError::RateLimited { .. })
    }

    /// The back-off carried by a [`LimiterError::RateLimited`] error.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LimiterError::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Result type alias for rate limiter operations.
pub type Result<T> = std::result::Result<T, LimiterError>;
