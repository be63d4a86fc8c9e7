//! All-or-nothing composition of named limiters.

use super::RateLimiter;
use crate::clock::{default_sleeper, Sleeper};
use crate::errors::RateLimitError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Enforces every member limiter at once.
///
/// `acquire` holds one lock across the whole probe, wait and commit sequence.
/// It probes every member without consuming, waits for the largest reported
/// wait (waits overlap on the same clock, so they do not add up), then commits
/// to each member. A member that refuses at commit time has every earlier
/// member refunded, so a failed acquisition leaves all budgets untouched.
#[derive(Debug)]
pub struct CompositeRateLimiter {
    name: String,
    limiters: Vec<(String, Arc<dyn RateLimiter>)>,
    sleeper: Arc<dyn Sleeper>,
    lock: Mutex<()>,
}

impl Default for CompositeRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl CompositeRateLimiter {
    pub fn new() -> Self {
        Self::named("composite")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            limiters: Vec::new(),
            sleeper: default_sleeper(),
            lock: Mutex::new(()),
        }
    }

    /// Add a member limiter.
    pub fn with_limiter(
        mut self,
        name: impl Into<String>,
        limiter: Arc<dyn RateLimiter>,
    ) -> Self {
        self.limiters.push((name.into(), limiter));
        self
    }

    /// Use a different sleep primitive for composite waits.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Member names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.limiters.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    /// Member with the longest wait, if any member must wait.
    fn slowest(&self, permits: u32) -> Option<(&str, &Arc<dyn RateLimiter>, Duration)> {
        self.limiters
            .iter()
            .map(|(name, limiter)| (name.as_str(), limiter, limiter.wait_time(permits)))
            .filter(|(_, _, wait)| !wait.is_zero())
            .max_by_key(|(_, _, wait)| *wait)
    }

    /// Decide what to do after probing: `Ok(None)` means commit now.
    fn plan(&self, permits: u32) -> Result<Option<Duration>, RateLimitError> {
        match self.slowest(permits) {
            None => Ok(None),
            Some((name, limiter, wait)) if !limiter.wait_on_limit() => {
                Err(RateLimitError::exceeded(name, wait))
            }
            Some((name, _, wait)) => {
                debug!(
                    limiter = %self.name,
                    member = name,
                    wait_ms = wait.as_millis() as u64,
                    "Composite limiter waiting"
                );
                Ok(Some(wait))
            }
        }
    }

    /// Take `permits` from every member, refunding on the first refusal.
    fn commit(&self, permits: u32) -> Result<(), RateLimitError> {
        for (index, (name, limiter)) in self.limiters.iter().enumerate() {
            if let Err(error) = limiter.try_acquire(permits) {
                for (_, taken) in &self.limiters[..index] {
                    taken.refund(permits);
                }
                debug!(limiter = %self.name, member = %name, "Composite commit refused");
                return Err(error);
            }
        }
        Ok(())
    }

    fn check_members(&self, permits: u32) -> Result<(), RateLimitError> {
        self.limiters
            .iter()
            .try_for_each(|(_, limiter)| limiter.check_capacity(permits))
    }
}

#[async_trait]
impl RateLimiter for CompositeRateLimiter {
    fn name(&self) -> &str {
        &self.name
    }

    fn wait_on_limit(&self) -> bool {
        self.limiters.iter().all(|(_, limiter)| limiter.wait_on_limit())
    }

    fn check_capacity(&self, permits: u32) -> Result<(), RateLimitError> {
        self.check_members(permits)
    }

    fn wait_time(&self, permits: u32) -> Duration {
        self.slowest(permits)
            .map(|(_, _, wait)| wait)
            .unwrap_or(Duration::ZERO)
    }

    fn try_acquire(&self, permits: u32) -> Result<(), RateLimitError> {
        self.check_members(permits)?;
        let Ok(_guard) = self.lock.try_lock() else {
            return Err(RateLimitError::exceeded(self.name.clone(), Duration::ZERO));
        };

        if let Some((name, _, wait)) = self.slowest(permits) {
            return Err(RateLimitError::exceeded(name, wait));
        }
        self.commit(permits)
    }

    async fn acquire(&self, permits: u32) -> Result<(), RateLimitError> {
        self.check_members(permits)?;
        let _guard = self.lock.lock().await;

        loop {
            match self.plan(permits)? {
                Some(wait) => self.sleeper.sleep(wait).await,
                None => match self.commit(permits) {
                    Ok(()) => return Ok(()),
                    Err(error @ RateLimitError::ExceedsCapacity { .. }) => return Err(error),
                    // Consumed outside this composite since the probe.
                    Err(RateLimitError::Exceeded { .. }) => tokio::task::yield_now().await,
                },
            }
        }
    }

    fn acquire_blocking(&self, permits: u32) -> Result<(), RateLimitError> {
        self.check_members(permits)?;
        let _guard = loop {
            if let Ok(guard) = self.lock.try_lock() {
                break guard;
            }
            self.sleeper.sleep_blocking(Duration::from_millis(1));
        };

        loop {
            match self.plan(permits)? {
                Some(wait) => self.sleeper.sleep_blocking(wait),
                None => match self.commit(permits) {
                    Ok(()) => return Ok(()),
                    Err(error @ RateLimitError::ExceedsCapacity { .. }) => return Err(error),
                    Err(RateLimitError::Exceeded { .. }) => std::thread::yield_now(),
                },
            }
        }
    }

    fn refund(&self, permits: u32) {
        for (_, limiter) in &self.limiters {
            limiter.refund(permits);
        }
    }

    fn reset(&self) {
        for (_, limiter) in &self.limiters {
            limiter.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::resilience::rate_limiter::{
        SlidingWindow, SlidingWindowConfig, TokenBucket, TokenBucketConfig,
    };

    fn bucket(
        name: &str,
        config: TokenBucketConfig,
        clock: &Arc<ManualClock>,
    ) -> Arc<TokenBucket> {
        Arc::new(
            TokenBucket::named(name, config)
                .unwrap()
                .with_clock(clock.clone())
                .with_sleeper(clock.clone()),
        )
    }

    #[tokio::test]
    async fn test_waits_for_maximum_not_sum() {
        let clock = Arc::new(ManualClock::new());
        let fast = bucket("fast", TokenBucketConfig::new(1.0, 2.0), &clock);
        let slow = bucket("slow", TokenBucketConfig::new(1.0, 1.0), &clock);
        let composite = CompositeRateLimiter::new()
            .with_limiter("fast", fast.clone())
            .with_limiter("slow", slow.clone())
            .with_sleeper(clock.clone());

        composite.acquire(1).await.unwrap();
        composite.acquire(1).await.unwrap();

        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1)]);
        assert!(fast.available() < 1e-6);
        assert!(slow.available() < 1e-6);
    }

    #[tokio::test]
    async fn test_non_waiting_member_fails_without_consuming() {
        let clock = Arc::new(ManualClock::new());
        let bucket = bucket("bucket", TokenBucketConfig::new(5.0, 1.0), &clock);
        let window_config = SlidingWindowConfig::new(1, Duration::from_secs(60));
        let window = Arc::new(
            SlidingWindow::named("window", window_config)
                .unwrap()
                .with_clock(clock.clone()),
        );
        let composite = CompositeRateLimiter::new()
            .with_limiter("bucket", bucket.clone())
            .with_limiter("window", window.clone())
            .with_sleeper(clock.clone());

        composite.acquire(1).await.unwrap();
        assert_eq!(bucket.available(), 4.0);

        let err = composite.acquire(1).await.unwrap_err();
        assert_eq!(err.limiter(), "window");
        assert_eq!(bucket.available(), 4.0);
        assert_eq!(window.request_count(), 1);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_commit_refusal_refunds_earlier_members() {
        let clock = Arc::new(ManualClock::new());
        let first = bucket("first", TokenBucketConfig::new(3.0, 1.0), &clock);
        let second = bucket(
            "second",
            TokenBucketConfig::new(3.0, 1.0).with_wait_on_limit(false),
            &clock,
        );
        let composite = CompositeRateLimiter::new()
            .with_limiter("first", first.clone())
            .with_limiter("second", second.clone());

        assert!(second.consume(3));
        assert!(composite.try_acquire(1).is_err());
        assert_eq!(first.available(), 3.0);

        // Bypass the probe to force a refusal at commit time.
        assert!(composite.commit(1).is_err());
        assert_eq!(first.available(), 3.0);
    }

    #[tokio::test]
    async fn test_capacity_is_checked_up_front() {
        let clock = Arc::new(ManualClock::new());
        let small = bucket("small", TokenBucketConfig::new(2.0, 1.0), &clock);
        let large = bucket("large", TokenBucketConfig::new(10.0, 1.0), &clock);
        let composite = CompositeRateLimiter::new()
            .with_limiter("large", large.clone())
            .with_limiter("small", small);

        let err = composite.acquire(5).await.unwrap_err();
        assert!(matches!(err, RateLimitError::ExceedsCapacity { .. }));
        assert_eq!(large.available(), 10.0);
    }

    #[test]
    fn test_acquire_blocking_waits_for_maximum() {
        let clock = Arc::new(ManualClock::new());
        let a = bucket("a", TokenBucketConfig::new(1.0, 4.0), &clock);
        let b = bucket("b", TokenBucketConfig::new(1.0, 2.0), &clock);
        let composite = CompositeRateLimiter::new()
            .with_limiter("a", a)
            .with_limiter("b", b)
            .with_sleeper(clock.clone());

        composite.acquire_blocking(1).unwrap();
        composite.acquire_blocking(1).unwrap();
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(500)]);
    }

    #[test]
    fn test_wait_time_and_names() {
        let clock = Arc::new(ManualClock::new());
        let a = bucket("a", TokenBucketConfig::new(1.0, 1.0), &clock);
        let composite = CompositeRateLimiter::new().with_limiter("a", a.clone());

        assert_eq!(composite.wait_time(1), Duration::ZERO);
        assert!(a.consume(1));
        assert_eq!(composite.wait_time(1), Duration::from_secs(1));
        assert_eq!(composite.names().collect::<Vec<_>>(), vec!["a"]);
        assert!(composite.wait_on_limit());
    }
}
