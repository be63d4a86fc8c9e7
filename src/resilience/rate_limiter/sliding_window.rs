//! Sliding window request counter.

use super::{RateLimiter, RateLimiterStats};
use crate::clock::{default_clock, Clock};
use crate::errors::{ConfigError, ConfigResult, RateLimitError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for a sliding window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlidingWindowConfig {
    /// Requests allowed inside one window
    pub max_requests: u32,
    /// Length of the trailing window
    pub window: Duration,
}

impl Default for SlidingWindowConfig {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window: Duration::from_secs(60),
        }
    }
}

impl SlidingWindowConfig {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    /// Check the configuration's invariants.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_requests == 0 {
            return Err(ConfigError::invalid("max_requests", "must be at least 1"));
        }
        if self.window.is_zero() {
            return Err(ConfigError::invalid("window", "must be greater than zero"));
        }
        Ok(())
    }
}

/// Allow/deny gate counting requests in a trailing window.
///
/// It never waits. A request recorded at `t` stops counting once
/// `now - window >= t`.
#[derive(Debug)]
pub struct SlidingWindow {
    name: String,
    config: SlidingWindowConfig,
    clock: Arc<dyn Clock>,
    timestamps: Mutex<VecDeque<Duration>>,
    acquired: AtomicU64,
    rejected: AtomicU64,
}

impl SlidingWindow {
    pub fn new(config: SlidingWindowConfig) -> ConfigResult<Self> {
        Self::named("sliding_window", config)
    }

    pub fn named(name: impl Into<String>, config: SlidingWindowConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            clock: default_clock(),
            timestamps: Mutex::new(VecDeque::new()),
            acquired: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    /// Use a different time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &SlidingWindowConfig {
        &self.config
    }

    /// Record one request if the window has room.
    pub fn allow_request(&self) -> bool {
        RateLimiter::try_acquire(self, 1).is_ok()
    }

    /// Requests currently counted in the window.
    pub fn request_count(&self) -> usize {
        let now = self.clock.now();
        let mut timestamps = self.timestamps.lock();
        self.evict(&mut timestamps, now);
        timestamps.len()
    }

    /// Drop timestamps that have left the window.
    pub fn cleanup(&self) {
        let now = self.clock.now();
        self.evict(&mut self.timestamps.lock(), now);
    }

    pub fn stats(&self) -> RateLimiterStats {
        let count = self.request_count();
        RateLimiterStats {
            name: self.name.clone(),
            available: f64::from(self.config.max_requests) - count as f64,
            capacity: f64::from(self.config.max_requests),
            acquired: self.acquired.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            waits: 0,
        }
    }

    fn evict(&self, timestamps: &mut VecDeque<Duration>, now: Duration) {
        let Some(cutoff) = now.checked_sub(self.config.window) else {
            return;
        };
        while timestamps.front().map_or(false, |t| *t <= cutoff) {
            timestamps.pop_front();
        }
    }

    fn wait_locked(
        &self,
        timestamps: &VecDeque<Duration>,
        now: Duration,
        permits: u32,
    ) -> Duration {
        let max = self.config.max_requests as usize;
        let needed = timestamps.len() + permits as usize;
        if needed <= max {
            return Duration::ZERO;
        }

        // Oldest entry whose expiry frees enough slots.
        timestamps
            .get(needed - max - 1)
            .map(|t| t.saturating_add(self.config.window).saturating_sub(now))
            .unwrap_or(self.config.window)
    }
}

#[async_trait]
impl RateLimiter for SlidingWindow {
    fn name(&self) -> &str {
        &self.name
    }

    fn wait_on_limit(&self) -> bool {
        false
    }

    fn check_capacity(&self, permits: u32) -> Result<(), RateLimitError> {
        if permits > self.config.max_requests {
            return Err(RateLimitError::ExceedsCapacity {
                limiter: self.name.clone(),
                requested: permits,
                capacity: f64::from(self.config.max_requests),
            });
        }
        Ok(())
    }

    fn wait_time(&self, permits: u32) -> Duration {
        let now = self.clock.now();
        let mut timestamps = self.timestamps.lock();
        self.evict(&mut timestamps, now);
        self.wait_locked(&timestamps, now, permits)
    }

    fn try_acquire(&self, permits: u32) -> Result<(), RateLimitError> {
        self.check_capacity(permits)?;

        let now = self.clock.now();
        let wait = {
            let mut timestamps = self.timestamps.lock();
            self.evict(&mut timestamps, now);
            let wait = self.wait_locked(&timestamps, now, permits);
            if wait.is_zero() {
                timestamps.extend(std::iter::repeat(now).take(permits as usize));
            }
            wait
        };

        if wait.is_zero() {
            self.acquired.fetch_add(1, Ordering::Relaxed);
            Ok(())
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            Err(RateLimitError::exceeded(self.name.clone(), wait))
        }
    }

    async fn acquire(&self, permits: u32) -> Result<(), RateLimitError> {
        RateLimiter::try_acquire(self, permits)
    }

    fn acquire_blocking(&self, permits: u32) -> Result<(), RateLimitError> {
        RateLimiter::try_acquire(self, permits)
    }

    fn refund(&self, permits: u32) {
        let mut timestamps = self.timestamps.lock();
        for _ in 0..permits {
            if timestamps.pop_back().is_none() {
                break;
            }
        }
    }

    fn reset(&self) {
        self.timestamps.lock().clear();
    }
}
