//! Rate limiting logic and state management.

mod backend;
mod bucket;
mod clock;
mod config;
pub(crate) mod global;
mod headers;
mod limiter;
pub(crate) mod route;
pub(crate) mod work;

pub use backend::RestRateLimiter;
pub use clock::{Clock, SystemClock};
pub use config::RateLimitConfig;
pub use global::{AtomicGlobalRateLimit, GlobalRateLimit, NO_LIMIT};
pub use headers::{
    RateLimitHeaders, RateLimitScope, GLOBAL_HEADER, HASH_HEADER, LIMIT_HEADER, REMAINING_HEADER,
    RESET_AFTER_HEADER, RESET_HEADER, RETRY_AFTER_HEADER, SCOPE_HEADER,
};
pub use limiter::{LimiterState, SequentialRateLimiter};
pub use route::{BucketScope, Route};
pub use work::{PendingResponse, Request, Work};
