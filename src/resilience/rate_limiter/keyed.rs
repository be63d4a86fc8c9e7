//! One token bucket per endpoint.

use super::{RateLimitHeaders, RateLimiterStats, TokenBucket, TokenBucketConfig};
use crate::clock::{default_clock, default_sleeper, Clock, Sleeper};
use crate::errors::{ConfigResult, RateLimitError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Lazily created, independent token buckets keyed by endpoint.
///
/// Buckets for different endpoints never contend with each other; the map lock
/// is only held to look up or insert a bucket.
#[derive(Debug)]
pub struct EndpointRateLimiters {
    default_config: TokenBucketConfig,
    overrides: HashMap<String, TokenBucketConfig>,
    buckets: Mutex<HashMap<String, Arc<TokenBucket>>>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl EndpointRateLimiters {
    /// Create an empty set whose buckets use `default_config`.
    pub fn new(default_config: TokenBucketConfig) -> ConfigResult<Self> {
        default_config.validate()?;
        Ok(Self {
            default_config,
            overrides: HashMap::new(),
            buckets: Mutex::new(HashMap::new()),
            clock: default_clock(),
            sleeper: default_sleeper(),
        })
    }

    /// Use a dedicated configuration for `endpoint`.
    pub fn with_override(
        mut self,
        endpoint: impl Into<String>,
        config: TokenBucketConfig,
    ) -> ConfigResult<Self> {
        config.validate()?;
        self.overrides.insert(endpoint.into(), config);
        Ok(self)
    }

    /// Time source handed to every bucket created from now on.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sleep primitive handed to every bucket created from now on.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// The bucket for `endpoint`, created on first use.
    pub fn limiter(&self, endpoint: &str) -> Arc<TokenBucket> {
        let mut buckets = self.buckets.lock();
        if let Some(bucket) = buckets.get(endpoint) {
            return Arc::clone(bucket);
        }

        let config = self
            .overrides
            .get(endpoint)
            .unwrap_or(&self.default_config)
            .clone();
        let bucket = Arc::new(
            TokenBucket::from_validated(endpoint.to_string(), config)
                .with_clock(Arc::clone(&self.clock))
                .with_sleeper(Arc::clone(&self.sleeper)),
        );
        buckets.insert(endpoint.to_string(), Arc::clone(&bucket));
        bucket
    }

    /// Acquire `permits` from `endpoint`'s bucket, waiting if it waits on limit.
    pub async fn acquire(&self, endpoint: &str, permits: u32) -> Result<(), RateLimitError> {
        let bucket = self.limiter(endpoint);
        bucket.acquire(permits).await
    }

    /// Take `permits` from `endpoint`'s bucket if available.
    pub fn try_acquire(&self, endpoint: &str, permits: u32) -> bool {
        self.limiter(endpoint).consume(permits)
    }

    /// Feed server-reported limits into `endpoint`'s bucket.
    pub fn update_from_headers(&self, endpoint: &str, headers: &RateLimitHeaders) {
        self.limiter(endpoint).update_from_headers(headers);
    }

    /// Endpoints with a bucket.
    pub fn endpoints(&self) -> Vec<String> {
        let mut endpoints: Vec<String> = self.buckets.lock().keys().cloned().collect();
        endpoints.sort();
        endpoints
    }

    /// Stats for every bucket, sorted by endpoint.
    pub fn stats(&self) -> Vec<RateLimiterStats> {
        let buckets: Vec<Arc<TokenBucket>> = self.buckets.lock().values().cloned().collect();
        let mut stats: Vec<RateLimiterStats> = buckets.iter().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Drop every bucket; the next use starts full.
    pub fn reset_all(&self) {
        self.buckets.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn limiters() -> (EndpointRateLimiters, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let limiters = EndpointRateLimiters::new(TokenBucketConfig::new(2.0, 1.0))
            .unwrap()
            .with_override("chat.postMessage", TokenBucketConfig::new(1.0, 1.0))
            .unwrap()
            .with_clock(clock.clone())
            .with_sleeper(clock.clone());
        (limiters, clock)
    }

    #[test]
    fn test_endpoints_are_independent() {
        let (limiters, _) = limiters();
        assert!(limiters.try_acquire("users.list", 2));
        assert!(!limiters.try_acquire("users.list", 1));
        assert!(limiters.try_acquire("conversations.list", 1));
        assert_eq!(limiters.endpoints(), vec!["conversations.list", "users.list"]);
    }

    #[test]
    fn test_override_applies() {
        let (limiters, _) = limiters();
        assert!(limiters.try_acquire("chat.postMessage", 1));
        assert!(!limiters.try_acquire("chat.postMessage", 1));
        assert_eq!(limiters.limiter("chat.postMessage").config().capacity, 1.0);
    }

    #[test]
    fn test_same_bucket_is_returned() {
        let (limiters, _) = limiters();
        let a = limiters.limiter("x");
        let b = limiters.limiter("x");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_acquire_waits_per_endpoint() {
        let (limiters, clock) = limiters();
        limiters.acquire("chat.postMessage", 1).await.unwrap();
        limiters.acquire("chat.postMessage", 1).await.unwrap();
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1)]);
    }

    #[test]
    fn test_update_from_headers_and_reset() {
        let (limiters, _) = limiters();
        limiters.update_from_headers(
            "users.list",
            &RateLimitHeaders {
                remaining: Some(0),
                ..Default::default()
            },
        );
        assert!(!limiters.try_acquire("users.list", 1));
        assert_eq!(limiters.stats()[0].name, "users.list");

        limiters.reset_all();
        assert!(limiters.endpoints().is_empty());
        assert!(limiters.try_acquire("users.list", 2));
    }

    #[test]
    fn test_invalid_override_rejected() {
        let result = EndpointRateLimiters::new(TokenBucketConfig::default())
            .unwrap()
            .with_override("bad", TokenBucketConfig::new(0.0, 1.0));
        assert!(result.is_err());
    }
}
