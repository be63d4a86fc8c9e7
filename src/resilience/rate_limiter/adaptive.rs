//! Adaptive (AIMD) rate limiter.

use super::{RateLimiter, RateLimiterStats, TokenBucket, TokenBucketConfig};
use crate::clock::{Clock, Sleeper};
use crate::errors::{ConfigError, ConfigResult, RateLimitError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for [`AdaptiveRateLimiter`]
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveConfig {
    /// Starting rate in requests per second
    pub initial_rate: f64,
    /// Floor for the rate
    pub min_rate: f64,
    /// Ceiling for the rate
    pub max_rate: f64,
    /// Multiplier applied on every rate-limit hit
    pub decrease_factor: f64,
    /// Multiplier applied after `success_threshold` successes in a row
    pub increase_factor: f64,
    /// Successes in a row needed before raising the rate
    pub success_threshold: u32,
    /// Burst size of the underlying bucket
    pub capacity: f64,
    /// Whether to wait for budget or fail immediately
    pub wait_on_limit: bool,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            initial_rate: 10.0,
            min_rate: 1.0,
            max_rate: 100.0,
            decrease_factor: 0.5,
            increase_factor: 1.1,
            success_threshold: 10,
            capacity: 10.0,
            wait_on_limit: true,
        }
    }
}

impl AdaptiveConfig {
    /// Check the configuration's invariants.
    pub fn validate(&self) -> ConfigResult<()> {
        let positive = |v: f64| v.is_finite() && v > 0.0;

        if !positive(self.min_rate) {
            return Err(ConfigError::invalid("min_rate", "must be positive"));
        }
        if !(positive(self.max_rate) && self.max_rate >= self.min_rate) {
            return Err(ConfigError::invalid("max_rate", "must be at least min_rate"));
        }
        if !(self.initial_rate >= self.min_rate && self.initial_rate <= self.max_rate) {
            return Err(ConfigError::invalid(
                "initial_rate",
                "must lie within [min_rate, max_rate]",
            ));
        }
        if !(self.decrease_factor > 0.0 && self.decrease_factor < 1.0) {
            return Err(ConfigError::invalid(
                "decrease_factor",
                "must lie strictly between 0 and 1",
            ));
        }
        if !(self.increase_factor.is_finite() && self.increase_factor >= 1.0) {
            return Err(ConfigError::invalid("increase_factor", "must be at least 1"));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::invalid("success_threshold", "must be at least 1"));
        }
        if !positive(self.capacity) {
            return Err(ConfigError::invalid("capacity", "must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct AdaptiveState {
    current_rate: f64,
    consecutive_successes: u32,
}

/// Rate limiter that cuts its rate on every server rate-limit hit and raises it
/// slowly after sustained success.
///
/// Enforcement is delegated to a token bucket whose refill rate follows
/// `current_rate`.
#[derive(Debug)]
pub struct AdaptiveRateLimiter {
    config: AdaptiveConfig,
    state: Mutex<AdaptiveState>,
    bucket: TokenBucket,
}

impl AdaptiveRateLimiter {
    pub fn new(config: AdaptiveConfig) -> ConfigResult<Self> {
        Self::named("adaptive", config)
    }

    pub fn named(name: impl Into<String>, config: AdaptiveConfig) -> ConfigResult<Self> {
        config.validate()?;
        let bucket_config = TokenBucketConfig::new(config.capacity, config.initial_rate)
            .with_wait_on_limit(config.wait_on_limit)
            .with_max_wait(None);

        Ok(Self {
            state: Mutex::new(AdaptiveState {
                current_rate: config.initial_rate,
                consecutive_successes: 0,
            }),
            bucket: TokenBucket::from_validated(name.into(), bucket_config),
            config,
        })
    }

    /// Use a different time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.bucket = self.bucket.with_clock(clock);
        self
    }

    /// Use a different sleep primitive.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.bucket = self.bucket.with_sleeper(sleeper);
        self
    }

    pub fn config(&self) -> &AdaptiveConfig {
        &self.config
    }

    /// Current rate in requests per second.
    pub fn current_rate(&self) -> f64 {
        self.state.lock().current_rate
    }

    /// React to a server-side rate limit.
    pub fn record_rate_limit_hit(&self) {
        let rate = {
            let mut state = self.state.lock();
            state.current_rate =
                (state.current_rate * self.config.decrease_factor).max(self.config.min_rate);
            state.consecutive_successes = 0;
            self.bucket.set_refill_rate(state.current_rate);
            state.current_rate
        };
        warn!(limiter = %self.bucket.name(), rate, "Decreased adaptive rate");
    }

    /// Count a success, raising the rate once the streak reaches the threshold.
    pub fn record_success(&self) {
        let raised = {
            let mut state = self.state.lock();
            state.consecutive_successes += 1;
            if state.consecutive_successes < self.config.success_threshold {
                None
            } else {
                state.consecutive_successes = 0;
                state.current_rate =
                    (state.current_rate * self.config.increase_factor).min(self.config.max_rate);
                self.bucket.set_refill_rate(state.current_rate);
                Some(state.current_rate)
            }
        };
        if let Some(rate) = raised {
            debug!(limiter = %self.bucket.name(), rate, "Increased adaptive rate");
        }
    }

    pub fn stats(&self) -> RateLimiterStats {
        self.bucket.stats()
    }
}

#[async_trait]
impl RateLimiter for AdaptiveRateLimiter {
    fn name(&self) -> &str {
        self.bucket.name()
    }

    fn wait_on_limit(&self) -> bool {
        self.config.wait_on_limit
    }

    fn check_capacity(&self, permits: u32) -> Result<(), RateLimitError> {
        self.bucket.check_capacity(permits)
    }

    fn wait_time(&self, permits: u32) -> Duration {
        self.bucket.wait_time_for(permits)
    }

    fn try_acquire(&self, permits: u32) -> Result<(), RateLimitError> {
        self.bucket.try_acquire(permits)
    }

    async fn acquire(&self, permits: u32) -> Result<(), RateLimitError> {
        self.bucket.acquire(permits).await
    }

    fn acquire_blocking(&self, permits: u32) -> Result<(), RateLimitError> {
        self.bucket.acquire_blocking(permits)
    }

    fn refund(&self, permits: u32) {
        self.bucket.refund(permits);
    }

    fn reset(&self) {
        let mut state = self.state.lock();
        state.current_rate = self.config.initial_rate;
        state.consecutive_successes = 0;
        RateLimiter::reset(&self.bucket);
    }
}
