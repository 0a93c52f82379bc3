//! Interpretation of rate limit response headers.
//!
//! Header lookups through [`HeaderMap`] are case-insensitive. A header that is
//! missing or malformed never changes bucket state.

use std::str::FromStr;
use std::time::{Duration, UNIX_EPOCH};

use http::{HeaderMap, HeaderValue};
use thiserror::Error;

/// The number of seconds to wait before submitting another request
pub const RETRY_AFTER_HEADER: &str = "retry-after";
/// The number of requests that can be made
pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
/// The number of remaining requests that can be made
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
/// Epoch time (seconds) at which the rate limit resets
pub const RESET_HEADER: &str = "x-ratelimit-reset";
/// Seconds until the current window resets, may contain decimals
pub const RESET_AFTER_HEADER: &str = "x-ratelimit-reset-after";
/// Opaque id of the rate limit bucket the route belongs to
pub const HASH_HEADER: &str = "x-ratelimit-bucket";
/// Set on 429 responses caused by the global limit
pub const GLOBAL_HEADER: &str = "x-ratelimit-global";
/// Set on 429 responses: `user`, `global` or `shared`
pub const SCOPE_HEADER: &str = "x-ratelimit-scope";

const RATE_LIMIT_PREFIX: &str = "x-ratelimit-";

/// Upper bound for any delay or reset reported by the remote.
pub(crate) const MAX_DELAY: Duration = Duration::from_secs(24 * 60 * 60);
const MAX_DELAY_MILLIS: i64 = MAX_DELAY.as_millis() as i64;

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum RetryAfterParseError {
    #[error("Unable to parse value '{0}'")]
    ValueError(String),

    #[error("Header value contains invalid chars")]
    HeaderValueError,
}

/// Classification of a 429 response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitScope {
    /// Per-user limit
    User,
    /// Per-user global limit
    Global,
    /// Per-resource limit shared with other users
    Shared,
}

impl FromStr for RateLimitScope {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(RateLimitScope::User),
            "global" => Ok(RateLimitScope::Global),
            "shared" => Ok(RateLimitScope::Shared),
            _ => Err(()),
        }
    }
}

/// Rate limit information extracted from a single response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitHeaders {
    /// Requests allowed per window
    pub limit: Option<u32>,
    /// Requests left in the current window
    pub remaining: Option<u32>,
    /// Window reset time in epoch milliseconds
    pub reset_at: Option<i64>,
    /// Delay requested by `Retry-After`
    pub retry_after: Option<Duration>,
    /// Discovered bucket hash
    pub bucket: Option<String>,
    /// Whether a 429 applies to the global limit
    pub global: bool,
    /// Informational scope of a 429
    pub scope: Option<RateLimitScope>,
    has_rate_limit_headers: bool,
}

impl RateLimitHeaders {
    /// Parse the recognized headers of a response received at `now`
    /// (epoch milliseconds).
    ///
    /// With `relative` set, `X-RateLimit-Reset-After` is preferred over
    /// `X-RateLimit-Reset`; either one is used when the other is absent.
    pub fn parse(headers: &HeaderMap, now: i64, relative: bool) -> Self {
        let latest = now.saturating_add(MAX_DELAY_MILLIS);
        let absolute_reset =
            parse_seconds(headers, RESET_HEADER).map(|s| ((s * 1000.0).round() as i64).min(latest));
        let relative_reset = parse_seconds(headers, RESET_AFTER_HEADER)
            .map(|s| now.saturating_add(((s * 1000.0).ceil() as i64).min(MAX_DELAY_MILLIS)));
        let reset_at = if relative {
            relative_reset.or(absolute_reset)
        } else {
            absolute_reset.or(relative_reset)
        };

        Self {
            limit: parse_number(headers, LIMIT_HEADER),
            remaining: parse_number(headers, REMAINING_HEADER),
            reset_at,
            retry_after: headers
                .get(RETRY_AFTER_HEADER)
                .and_then(|value| parse_retry_after(value, now).ok()),
            bucket: header_str(headers, HASH_HEADER)
                .filter(|hash| !hash.is_empty())
                .map(str::to_string),
            global: header_str(headers, GLOBAL_HEADER).is_some_and(|v| v.eq_ignore_ascii_case("true")),
            scope: header_str(headers, SCOPE_HEADER).and_then(|v| v.parse().ok()),
            has_rate_limit_headers: headers
                .keys()
                .any(|name| name.as_str().starts_with(RATE_LIMIT_PREFIX)),
        }
    }

    /// Back-off in milliseconds for a 429 received at `now`.
    ///
    /// Uses `Retry-After`, then the reset headers, then `fallback`. The
    /// result never exceeds [`MAX_DELAY`].
    pub fn retry_after_millis(&self, now: i64, fallback: Duration) -> i64 {
        let delay = match (self.retry_after, self.reset_at) {
            (Some(delay), _) => duration_millis(delay),
            (None, Some(reset_at)) if reset_at > now => reset_at.saturating_sub(now),
            _ => duration_millis(fallback),
        };
        delay.min(MAX_DELAY_MILLIS)
    }

    /// A 429 without any rate limit headers comes from the edge in front of
    /// the API rather than from a bucket.
    pub fn is_edge_block(&self) -> bool {
        !self.global && !self.has_rate_limit_headers
    }
}

/// Parse the "Retry-After" header as specified per
/// [RFC 7231 section 7.1.3](https://www.rfc-editor.org/rfc/rfc7231#section-7.1.3),
/// additionally accepting fractional seconds. Delays are capped at [`MAX_DELAY`].
pub(crate) fn parse_retry_after(value: &HeaderValue, now: i64) -> Result<Duration, RetryAfterParseError> {
    let value = value
        .to_str()
        .map_err(|_| RetryAfterParseError::HeaderValueError)?
        .trim();

    if let Ok(seconds) = value.parse::<f64>() {
        if !(seconds >= 0.0) {
            return Err(RetryAfterParseError::ValueError(value.into()));
        }
        return Duration::try_from_secs_f64(seconds.min(MAX_DELAY.as_secs_f64()))
            .map_err(|_| RetryAfterParseError::ValueError(value.into()));
    }

    let date = httpdate::parse_http_date(value)
        .map_err(|_| RetryAfterParseError::ValueError(value.into()))?;
    let date_millis = date
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    // if date is in the past, we can use ZERO
    let delay = date_millis.saturating_sub(now).clamp(0, MAX_DELAY_MILLIS);
    Ok(Duration::from_millis(delay as u64))
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok()).map(str::trim)
}

fn parse_number(headers: &HeaderMap, name: &str) -> Option<u32> {
    header_str(headers, name).and_then(|value| value.parse().ok())
}

fn parse_seconds(headers: &HeaderMap, name: &str) -> Option<f64> {
    header_str(headers, name)
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::header_map;

    const NOW: i64 = 1_700_000_000_000;

    fn value(v: &str) -> HeaderValue {
        HeaderValue::from_str(v).unwrap()
    }

    #[test]
    fn test_retry_after() {
        assert_eq!(parse_retry_after(&value("1"), NOW), Ok(Duration::from_secs(1)));
        assert_eq!(parse_retry_after(&value("0.25"), NOW), Ok(Duration::from_millis(250)));
        assert_eq!(
            parse_retry_after(&value("-1"), NOW),
            Err(RetryAfterParseError::ValueError("-1".into()))
        );

        assert_eq!(
            parse_retry_after(&value("Fri, 15 May 2015 15:34:21 GMT"), NOW),
            Ok(Duration::ZERO)
        );

        let result = parse_retry_after(&value("Fri, 15 May 4099 15:34:21 GMT"), NOW);
        let is_in_future = matches!(result, Ok(d) if d.as_secs() > 0);
        assert!(is_in_future);

        assert!(parse_retry_after(&value("NaN"), NOW).is_err());
        assert_eq!(parse_retry_after(&value("inf"), NOW), Ok(MAX_DELAY));
    }

    #[test]
    fn test_huge_values_are_capped() {
        assert_eq!(parse_retry_after(&value("1e300"), NOW), Ok(MAX_DELAY));
        assert_eq!(parse_retry_after(&value("Fri, 15 May 9999 15:34:21 GMT"), NOW), Ok(MAX_DELAY));

        let relative = header_map(&[("X-RateLimit-Reset-After", "1e300")]);
        let parsed = RateLimitHeaders::parse(&relative, NOW, true);
        assert_eq!(parsed.reset_at, Some(NOW + MAX_DELAY_MILLIS));

        let absolute = header_map(&[("X-RateLimit-Reset", "1e300")]);
        let parsed = RateLimitHeaders::parse(&absolute, NOW, false);
        assert_eq!(parsed.reset_at, Some(NOW + MAX_DELAY_MILLIS));

        let retry = header_map(&[("Retry-After", "1e300")]);
        let parsed = RateLimitHeaders::parse(&retry, NOW, true);
        assert_eq!(parsed.retry_after, Some(MAX_DELAY));
        assert_eq!(parsed.retry_after_millis(NOW, Duration::ZERO), MAX_DELAY_MILLIS);

        let parsed = RateLimitHeaders::parse(&HeaderMap::new(), NOW, true);
        assert_eq!(parsed.retry_after_millis(NOW, Duration::MAX), MAX_DELAY_MILLIS);
    }

    #[test]
    fn test_parse_full_header_set() {
        let headers = header_map(&[
            ("X-RateLimit-Limit", "5"),
            ("X-RateLimit-Remaining", "4"),
            ("X-RateLimit-Reset", "1700000002.5"),
            ("X-RateLimit-Reset-After", "1.25"),
            ("X-RateLimit-Bucket", "abcd1234"),
        ]);

        let relative = RateLimitHeaders::parse(&headers, NOW, true);
        assert_eq!(relative.limit, Some(5));
        assert_eq!(relative.remaining, Some(4));
        assert_eq!(relative.reset_at, Some(NOW + 1250));
        assert_eq!(relative.bucket.as_deref(), Some("abcd1234"));
        assert!(!relative.global);
        assert!(!relative.is_edge_block());

        let absolute = RateLimitHeaders::parse(&headers, NOW, false);
        assert_eq!(absolute.reset_at, Some(1_700_000_002_500));
    }

    #[test]
    fn test_reset_falls_back_to_other_header() {
        let only_absolute = header_map(&[("X-RateLimit-Reset", "1700000003")]);
        assert_eq!(
            RateLimitHeaders::parse(&only_absolute, NOW, true).reset_at,
            Some(1_700_000_003_000)
        );

        let only_relative = header_map(&[("X-RateLimit-Reset-After", "2")]);
        assert_eq!(
            RateLimitHeaders::parse(&only_relative, NOW, false).reset_at,
            Some(NOW + 2000)
        );
    }

    #[test]
    fn test_missing_headers_mean_no_change() {
        let parsed = RateLimitHeaders::parse(&HeaderMap::new(), NOW, true);
        assert_eq!(parsed.limit, None);
        assert_eq!(parsed.remaining, None);
        assert_eq!(parsed.reset_at, None);
        assert_eq!(parsed.bucket, None);
        assert!(parsed.is_edge_block());
    }

    #[test]
    fn test_malformed_values_are_ignored() {
        let headers = header_map(&[
            ("X-RateLimit-Remaining", "-3"),
            ("X-RateLimit-Reset-After", "soon"),
            ("X-RateLimit-Bucket", ""),
        ]);
        let parsed = RateLimitHeaders::parse(&headers, NOW, true);

        assert_eq!(parsed.remaining, None);
        assert_eq!(parsed.reset_at, None);
        assert_eq!(parsed.bucket, None);
    }

    #[test]
    fn test_global_and_scope() {
        let headers = header_map(&[
            ("Retry-After", "3"),
            ("X-RateLimit-Global", "True"),
            ("X-RateLimit-Scope", "global"),
        ]);
        let parsed = RateLimitHeaders::parse(&headers, NOW, true);

        assert!(parsed.global);
        assert_eq!(parsed.scope, Some(RateLimitScope::Global));
        assert_eq!(parsed.retry_after, Some(Duration::from_secs(3)));
        assert!(!parsed.is_edge_block());

        let not_global = header_map(&[("X-RateLimit-Global", "false"), ("X-RateLimit-Scope", "shared")]);
        let parsed = RateLimitHeaders::parse(&not_global, NOW, true);
        assert!(!parsed.global);
        assert_eq!(parsed.scope, Some(RateLimitScope::Shared));
    }

    #[test]
    fn test_retry_after_millis_precedence() {
        let fallback = Duration::from_millis(700);

        let with_retry = header_map(&[("Retry-After", "2"), ("X-RateLimit-Reset-After", "5")]);
        let parsed = RateLimitHeaders::parse(&with_retry, NOW, true);
        assert_eq!(parsed.retry_after_millis(NOW, fallback), 2000);

        let with_reset = header_map(&[("X-RateLimit-Reset-After", "5")]);
        let parsed = RateLimitHeaders::parse(&with_reset, NOW, true);
        assert_eq!(parsed.retry_after_millis(NOW, fallback), 5000);

        let parsed = RateLimitHeaders::parse(&HeaderMap::new(), NOW, true);
        assert_eq!(parsed.retry_after_millis(NOW, fallback), 700);
    }
}
