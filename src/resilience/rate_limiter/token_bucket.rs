//! Token bucket rate limiter.

use super::{RateLimitHeaders, RateLimiter, RateLimiterStats, TOKEN_EPSILON};
use crate::clock::{default_clock, default_sleeper, Clock, Sleeper};
use crate::errors::{ConfigError, ConfigResult, RateLimitError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for a token bucket
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBucketConfig {
    /// Maximum tokens in the bucket
    pub capacity: f64,
    /// Tokens refilled per second
    pub refill_rate: f64,
    /// Whether to wait for tokens or fail immediately
    pub wait_on_limit: bool,
    /// Maximum total time a single acquisition may wait
    pub max_wait: Option<Duration>,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            capacity: 50.0,
            refill_rate: 50.0,
            wait_on_limit: true,
            max_wait: Some(Duration::from_secs(60)),
        }
    }
}

impl TokenBucketConfig {
    /// Create a new configuration
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            ..Default::default()
        }
    }

    /// `n` requests per second with a burst of `n`
    pub fn per_second(n: u32) -> Self {
        Self::new(f64::from(n), f64::from(n))
    }

    /// `n` requests per minute with a burst of `n`
    pub fn per_minute(n: u32) -> Self {
        Self::new(f64::from(n), f64::from(n) / 60.0)
    }

    /// Set whether to wait for tokens
    pub fn with_wait_on_limit(mut self, wait: bool) -> Self {
        self.wait_on_limit = wait;
        self
    }

    /// Set maximum wait time
    pub fn with_max_wait(mut self, max_wait: Option<Duration>) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Check the configuration's invariants.
    pub fn validate(&self) -> ConfigResult<()> {
        if !(self.capacity.is_finite() && self.capacity > 0.0) {
            return Err(ConfigError::invalid("capacity", "must be positive"));
        }
        if !(self.refill_rate.is_finite() && self.refill_rate > 0.0) {
            return Err(ConfigError::invalid("refill_rate", "must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    refill_rate: f64,
    last_refill: Duration,
}

impl BucketState {
    fn refill(&mut self, now: Duration, capacity: f64) {
        let elapsed = now.saturating_sub(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(capacity);
        self.last_refill = now;
    }

    fn wait_for(&self, tokens: f64) -> Duration {
        if self.tokens + TOKEN_EPSILON >= tokens {
            return Duration::ZERO;
        }
        // Tiny refill rates can push the wait past what a Duration holds.
        Duration::try_from_secs_f64((tokens - self.tokens) / self.refill_rate)
            .unwrap_or(Duration::MAX)
    }
}

/// Token bucket limiter.
///
/// Every operation refills first, then checks. A waiting acquisition drops the
/// lock while it sleeps and retries refill-then-consume afterwards, so an
/// abandoned wait never holds tokens.
#[derive(Debug)]
pub struct TokenBucket {
    name: String,
    config: TokenBucketConfig,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    state: Mutex<BucketState>,
    acquired: AtomicU64,
    rejected: AtomicU64,
    waits: AtomicU64,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(config: TokenBucketConfig) -> ConfigResult<Self> {
        Self::named("token_bucket", config)
    }

    /// Create a full bucket with a name used in errors and logs.
    pub fn named(name: impl Into<String>, config: TokenBucketConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::from_validated(name.into(), config))
    }

    pub(crate) fn from_validated(name: String, config: TokenBucketConfig) -> Self {
        let clock = default_clock();
        let state = BucketState {
            tokens: config.capacity,
            refill_rate: config.refill_rate,
            last_refill: clock.now(),
        };
        Self {
            name,
            config,
            clock,
            sleeper: default_sleeper(),
            state: Mutex::new(state),
            acquired: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            waits: AtomicU64::new(0),
        }
    }

    /// Use a different time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.state.get_mut().last_refill = clock.now();
        self.clock = clock;
        self
    }

    /// Use a different sleep primitive.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn config(&self) -> &TokenBucketConfig {
        &self.config
    }

    /// Take `n` tokens if available.
    pub fn consume(&self, n: u32) -> bool {
        self.take(n).is_ok()
    }

    /// Time until `n` tokens are available.
    pub fn wait_time_for(&self, n: u32) -> Duration {
        let mut state = self.state.lock();
        state.refill(self.clock.now(), self.config.capacity);
        state.wait_for(f64::from(n))
    }

    /// Tokens currently in the bucket.
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        state.refill(self.clock.now(), self.config.capacity);
        state.tokens
    }

    /// Current refill rate in tokens per second.
    pub fn refill_rate(&self) -> f64 {
        self.state.lock().refill_rate
    }

    /// Change the refill rate. Tokens accrued so far use the old rate.
    pub fn set_refill_rate(&self, rate: f64) {
        if !(rate.is_finite() && rate > 0.0) {
            return;
        }
        let mut state = self.state.lock();
        state.refill(self.clock.now(), self.config.capacity);
        state.refill_rate = rate;
    }

    /// Adopt the server's view of the remaining budget when it is lower.
    pub fn update_from_headers(&self, headers: &RateLimitHeaders) {
        let Some(remaining) = headers.remaining else {
            return;
        };

        let mut state = self.state.lock();
        state.refill(self.clock.now(), self.config.capacity);
        let remaining = f64::from(remaining).min(self.config.capacity);
        if remaining < state.tokens {
            debug!(
                limiter = %self.name,
                local = state.tokens,
                remaining,
                "Adopting server-reported rate limit budget"
            );
            state.tokens = remaining;
        }
    }

    /// Wait for `n` tokens, sleeping on this bucket's sleeper.
    pub async fn acquire(&self, n: u32) -> Result<(), RateLimitError> {
        let mut waited = Duration::ZERO;
        loop {
            let wait = match self.take(n) {
                Ok(()) => return Ok(()),
                Err(wait) => self.admit_wait(n, wait, waited)?,
            };
            self.sleeper.sleep(wait).await;
            waited = waited.saturating_add(wait);
        }
    }

    /// Blocking variant of [`TokenBucket::acquire`].
    pub fn acquire_blocking(&self, n: u32) -> Result<(), RateLimitError> {
        let mut waited = Duration::ZERO;
        loop {
            let wait = match self.take(n) {
                Ok(()) => return Ok(()),
                Err(wait) => self.admit_wait(n, wait, waited)?,
            };
            self.sleeper.sleep_blocking(wait);
            waited = waited.saturating_add(wait);
        }
    }

    /// Snapshot of this bucket.
    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            name: self.name.clone(),
            available: self.available(),
            capacity: self.config.capacity,
            acquired: self.acquired.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
        }
    }

    fn ensure_capacity(&self, n: u32) -> Result<(), RateLimitError> {
        if f64::from(n) > self.config.capacity {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(RateLimitError::ExceedsCapacity {
                limiter: self.name.clone(),
                requested: n,
                capacity: self.config.capacity,
            });
        }
        Ok(())
    }

    /// Refill, then consume `n` tokens or report how long until they exist.
    fn take(&self, n: u32) -> Result<(), Duration> {
        let tokens = f64::from(n);
        let mut state = self.state.lock();
        state.refill(self.clock.now(), self.config.capacity);

        if state.tokens + TOKEN_EPSILON >= tokens {
            state.tokens = (state.tokens - tokens).max(0.0);
            drop(state);
            self.acquired.fetch_add(1, Ordering::Relaxed);
            Ok(())
        } else {
            Err(state.wait_for(tokens))
        }
    }

    /// Decide whether a caller may wait `wait` more, given `waited` so far.
    fn admit_wait(
        &self,
        n: u32,
        wait: Duration,
        waited: Duration,
    ) -> Result<Duration, RateLimitError> {
        self.ensure_capacity(n)?;

        let over_budget = self
            .config
            .max_wait
            .map_or(false, |max| waited.saturating_add(wait) > max);

        if !self.config.wait_on_limit || over_budget {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(
                limiter = %self.name,
                wait_ms = wait.as_millis() as u64,
                "Rate limit exceeded"
            );
            return Err(RateLimitError::exceeded(self.name.clone(), wait));
        }

        self.waits.fetch_add(1, Ordering::Relaxed);
        debug!(
            limiter = %self.name,
            wait_ms = wait.as_millis() as u64,
            "Waiting for rate limit tokens"
        );
        Ok(wait)
    }
}

#[async_trait]
impl RateLimiter for TokenBucket {
    fn name(&self) -> &str {
        &self.name
    }

    fn wait_on_limit(&self) -> bool {
        self.config.wait_on_limit
    }

    fn check_capacity(&self, permits: u32) -> Result<(), RateLimitError> {
        if f64::from(permits) > self.config.capacity {
            return Err(RateLimitError::ExceedsCapacity {
                limiter: self.name.clone(),
                requested: permits,
                capacity: self.config.capacity,
            });
        }
        Ok(())
    }

    fn wait_time(&self, permits: u32) -> Duration {
        self.wait_time_for(permits)
    }

    fn try_acquire(&self, permits: u32) -> Result<(), RateLimitError> {
        match self.take(permits) {
            Ok(()) => Ok(()),
            Err(wait) => {
                self.ensure_capacity(permits)?;
                self.rejected.fetch_add(1, Ordering::Relaxed);
                Err(RateLimitError::exceeded(self.name.clone(), wait))
            }
        }
    }

    async fn acquire(&self, permits: u32) -> Result<(), RateLimitError> {
        TokenBucket::acquire(self, permits).await
    }

    fn acquire_blocking(&self, permits: u32) -> Result<(), RateLimitError> {
        TokenBucket::acquire_blocking(self, permits)
    }

    fn refund(&self, permits: u32) {
        let mut state = self.state.lock();
        state.refill(self.clock.now(), self.config.capacity);
        state.tokens = (state.tokens + f64::from(permits)).min(self.config.capacity);
    }

    fn reset(&self) {
        let mut state = self.state.lock();
        state.tokens = self.config.capacity;
        state.refill_rate = self.config.refill_rate;
        state.last_refill = self.clock.now();
    }
}
