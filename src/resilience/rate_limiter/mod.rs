//! Client-side rate limiting.
//!
//! Every strategy implements [`RateLimiter`], so callers pick a strategy once at
//! construction and the retry executor and [`CompositeRateLimiter`] work with any
//! of them through a trait object.

mod adaptive;
mod composite;
mod headers;
mod keyed;
mod sliding_window;
mod token_bucket;

pub use adaptive::{AdaptiveConfig, AdaptiveRateLimiter};
pub use composite::CompositeRateLimiter;
pub use headers::RateLimitHeaders;
pub use keyed::EndpointRateLimiters;
pub use sliding_window::{SlidingWindow, SlidingWindowConfig};
pub use token_bucket::{TokenBucket, TokenBucketConfig};

use crate::errors::RateLimitError;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Tolerance for floating point token accounting.
pub(crate) const TOKEN_EPSILON: f64 = 1e-6;

/// Common contract of every rate-limiting strategy.
#[async_trait]
pub trait RateLimiter: Send + Sync + fmt::Debug {
    /// Name used in errors and logs.
    fn name(&self) -> &str;

    /// Whether `acquire` waits for budget instead of failing.
    fn wait_on_limit(&self) -> bool;

    /// Fail with `ExceedsCapacity` if `permits` could never be granted.
    fn check_capacity(&self, _permits: u32) -> Result<(), RateLimitError> {
        Ok(())
    }

    /// Time until `permits` could be granted, without consuming anything.
    fn wait_time(&self, permits: u32) -> Duration;

    /// Take `permits` now or fail without consuming anything.
    fn try_acquire(&self, permits: u32) -> Result<(), RateLimitError>;

    /// Take `permits`, waiting for budget if this limiter waits on limit.
    async fn acquire(&self, permits: u32) -> Result<(), RateLimitError>;

    /// Blocking variant of [`RateLimiter::acquire`].
    fn acquire_blocking(&self, permits: u32) -> Result<(), RateLimitError>;

    /// Return `permits` taken by a call that was later abandoned.
    fn refund(&self, _permits: u32) {}

    /// Restore the initial state.
    fn reset(&self);
}

/// Point-in-time view of a limiter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimiterStats {
    pub name: String,
    pub available: f64,
    pub capacity: f64,
    pub acquired: u64,
    pub rejected: u64,
    pub waits: u64,
}
