//! Configuration management for Ratequeue.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{LimiterError, Result};

/// Main configuration for the rate limiter and its HTTP client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Rate limiter configuration
    #[serde(default)]
    pub limiter: LimiterSettings,

    /// HTTP client configuration
    #[serde(default)]
    pub client: ClientSettings,
}

/// Rate limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Use `X-RateLimit-Reset-After` instead of `X-RateLimit-Reset`.
    /// This avoids depending on the local clock being in sync with the remote.
    #[serde(default = "default_relative_reset")]
    pub relative_reset: bool,

    /// How long an empty bucket is kept before it is dropped
    #[serde(default = "default_idle_timeout")]
    pub bucket_idle_timeout_secs: u64,

    /// How often idle buckets are swept
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Back-off used when a 429 response carries no usable delay
    #[serde(default = "default_retry_after")]
    pub default_retry_after_ms: u64,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            relative_reset: default_relative_reset(),
            bucket_idle_timeout_secs: default_idle_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            default_retry_after_ms: default_retry_after(),
        }
    }
}

impl LimiterSettings {
    /// Idle timeout as a [`Duration`].
    pub fn bucket_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.bucket_idle_timeout_secs)
    }

    /// Sweep interval as a [`Duration`].
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Fallback retry delay as a [`Duration`].
    pub fn default_retry_after(&self) -> Duration {
        Duration::from_millis(self.default_retry_after_ms)
    }
}

fn default_relative_reset() -> bool {
    true
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_retry_after() -> u64 {
    1000
}

/// HTTP client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Base URL that route paths are appended to
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Timeout for a single exchange, in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout(),
        }
    }
}

impl ClientSettings {
    /// Exchange timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_timeout() -> u64 {
    30
}

impl AppConfig {
    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: AppConfig = serde_yaml::from_str(yaml)
            .map_err(|e| LimiterError::Config(format!("Failed to parse configuration: {}", e)))?;

        if config.limiter.sweep_interval_secs == 0 {
            return Err(LimiterError::Config(
                "limiter.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(config)
    }
}
