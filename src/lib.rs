//! Ratequeue - Client-Side Sequential Rate Limiting
//!
//! This crate schedules outbound HTTP requests against a remote API that
//! enforces per-route bucket limits and global limits. Requests sharing a
//! bucket run one at a time in submission order, buckets run concurrently,
//! and 429 responses are waited out and retried.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod transport;
