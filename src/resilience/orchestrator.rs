use crate::clock::{default_clock, default_sleeper, Clock, Sleeper};
use crate::config::ResilienceConfig;
use crate::errors::{Classify, ConfigResult, ResilienceResult};
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerHook};
use crate::resilience::rate_limiter::{RateLimiter, TokenBucket, TokenBucketConfig};
use crate::resilience::retry::{ExecuteOptions, RetryConfig, RetryExecutor, RetryHook};
use crate::resilience::retry_after::{RetryAfterConfig, RetryAfterResolver};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// A circuit breaker, an optional token bucket and a Retry-After resolver wired
/// into one retry executor.
///
/// Every component is owned through an `Arc`, so the accessors hand out the
/// same instances the executor uses.
pub struct ResilienceOrchestrator {
    retry_executor: RetryExecutor,
    circuit_breaker: Arc<CircuitBreaker>,
    rate_limiter: Option<Arc<TokenBucket>>,
    retry_after: Arc<RetryAfterResolver>,
}

impl fmt::Debug for ResilienceOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilienceOrchestrator")
            .field("retry", self.retry_executor.config())
            .field("circuit_breaker", &self.circuit_breaker)
            .field("rate_limiter", &self.rate_limiter)
            .field("retry_after", &self.retry_after)
            .finish()
    }
}

impl ResilienceOrchestrator {
    /// Create a new resilience orchestrator with the given configuration
    pub fn new(config: ResilienceConfig) -> ConfigResult<Self> {
        Self::builder().config(config).build()
    }

    /// Create a builder for configuring the orchestrator
    pub fn builder() -> ResilienceOrchestratorBuilder {
        ResilienceOrchestratorBuilder::new()
    }

    /// Create an orchestrator that invokes the operation once and never trips.
    pub fn passthrough() -> Self {
        let circuit_breaker = Arc::new(CircuitBreaker::from_validated(
            "passthrough".to_string(),
            CircuitBreakerConfig {
                failure_threshold: u32::MAX,
                ..Default::default()
            },
        ));
        let retry_after = Arc::new(RetryAfterResolver::from_validated(RetryAfterConfig::default()));
        let retry_executor = RetryExecutor::from_validated(RetryConfig {
            max_retries: 1,
            ..Default::default()
        })
        .with_circuit_breaker(Arc::clone(&circuit_breaker))
        .with_retry_after(Arc::clone(&retry_after));

        Self {
            retry_executor,
            circuit_breaker,
            rate_limiter: None,
            retry_after,
        }
    }

    /// Get a reference to the retry executor
    pub fn retry_executor(&self) -> &RetryExecutor {
        &self.retry_executor
    }

    /// Get a reference to the circuit breaker
    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.circuit_breaker
    }

    /// Get a reference to the client-side rate limiter, if one is configured
    pub fn rate_limiter(&self) -> Option<&Arc<TokenBucket>> {
        self.rate_limiter.as_ref()
    }

    /// Get a reference to the Retry-After resolver
    pub fn retry_after(&self) -> &Arc<RetryAfterResolver> {
        &self.retry_after
    }

    /// Run `operation` through the full stack.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        self.retry_executor.execute(operation).await
    }

    /// Run `operation` through the full stack with per-call options.
    pub async fn execute_with<F, Fut, T, E>(
        &self,
        options: ExecuteOptions<E>,
        operation: F,
    ) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        self.retry_executor.execute_with(options, operation).await
    }
}

/// Builder for configuring resilience orchestrator
pub struct ResilienceOrchestratorBuilder {
    config: ResilienceConfig,
    name: String,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    retry_hook: Option<Arc<dyn RetryHook>>,
    breaker_hook: Option<Arc<dyn CircuitBreakerHook>>,
}

impl ResilienceOrchestratorBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: ResilienceConfig::default(),
            name: "default".to_string(),
            clock: default_clock(),
            sleeper: default_sleeper(),
            retry_hook: None,
            breaker_hook: None,
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: ResilienceConfig) -> Self {
        self.config = config;
        self
    }

    /// Name used for the circuit breaker and the token bucket in logs and stats
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the retry configuration
    pub fn retry_config(mut self, config: RetryConfig) -> Self {
        self.config.retry = config;
        self
    }

    /// Set the circuit breaker configuration
    pub fn circuit_breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.config.circuit_breaker = config;
        self
    }

    /// Set the rate limit configuration
    pub fn rate_limit_config(mut self, config: TokenBucketConfig) -> Self {
        self.config.rate_limit = Some(config);
        self
    }

    /// Set the Retry-After configuration
    pub fn retry_after_config(mut self, config: RetryAfterConfig) -> Self {
        self.config.retry_after = config;
        self
    }

    /// Time source shared by every component
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sleep primitive shared by the executor and the token bucket
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Attach a retry hook to the executor
    pub fn retry_hook(mut self, hook: Arc<dyn RetryHook>) -> Self {
        self.retry_hook = Some(hook);
        self
    }

    /// Observe circuit breaker transitions
    pub fn circuit_breaker_hook(mut self, hook: Arc<dyn CircuitBreakerHook>) -> Self {
        self.breaker_hook = Some(hook);
        self
    }

    /// Build the resilience orchestrator
    pub fn build(self) -> ConfigResult<ResilienceOrchestrator> {
        self.config.validate()?;

        let mut breaker = CircuitBreaker::named(self.name.clone(), self.config.circuit_breaker)?
            .with_clock(Arc::clone(&self.clock));
        if let Some(hook) = self.breaker_hook {
            breaker = breaker.with_hook(hook);
        }
        let circuit_breaker = Arc::new(breaker);

        let retry_after = Arc::new(
            RetryAfterResolver::new(self.config.retry_after)?.with_clock(Arc::clone(&self.clock)),
        );

        let rate_limiter = match self.config.rate_limit {
            Some(config) => Some(Arc::new(
                TokenBucket::named(self.name, config)?
                    .with_clock(Arc::clone(&self.clock))
                    .with_sleeper(Arc::clone(&self.sleeper)),
            )),
            None => None,
        };

        let mut retry_executor = RetryExecutor::new(self.config.retry)?
            .with_clock(self.clock)
            .with_sleeper(self.sleeper)
            .with_circuit_breaker(Arc::clone(&circuit_breaker))
            .with_retry_after(Arc::clone(&retry_after));
        if let Some(limiter) = &rate_limiter {
            retry_executor =
                retry_executor.with_rate_limiter(Arc::clone(limiter) as Arc<dyn RateLimiter>);
        }
        if let Some(hook) = self.retry_hook {
            retry_executor = retry_executor.with_hook(hook);
        }

        Ok(ResilienceOrchestrator {
            retry_executor,
            circuit_breaker,
            rate_limiter,
            retry_after,
        })
    }
}

impl Default for ResilienceOrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::errors::{ApiError, ResilienceError};
    use crate::resilience::circuit_breaker::CircuitState;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn manual_builder(clock: &Arc<ManualClock>) -> ResilienceOrchestratorBuilder {
        ResilienceOrchestrator::builder()
            .clock(clock.clone())
            .sleeper(clock.clone())
    }

    #[tokio::test]
    async fn test_orchestrator_executes_successfully() {
        let orchestrator = ResilienceOrchestrator::new(ResilienceConfig::default()).unwrap();

        let result = orchestrator.execute(|| async { Ok::<_, ApiError>(42) }).await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_orchestrator_retries_on_retryable_error() {
        let clock = Arc::new(ManualClock::new());
        let orchestrator = manual_builder(&clock)
            .retry_config(RetryConfig {
                max_retries: 3,
                base_delay: Duration::from_millis(10),
                jitter: 0.0,
                ..Default::default()
            })
            .build()
            .unwrap();

        let attempt_count = Arc::new(AtomicU32::new(0));
        let result = orchestrator
            .execute(|| {
                let count = attempt_count.clone();
                async move {
                    if count.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ApiError::server("Service unavailable", 503))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(10), Duration::from_millis(20)]
        );
        assert_eq!(orchestrator.circuit_breaker().consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_orchestrator_respects_circuit_breaker() {
        let clock = Arc::new(ManualClock::new());
        let orchestrator = manual_builder(&clock)
            .retry_config(RetryConfig {
                max_retries: 1,
                ..Default::default()
            })
            .circuit_breaker_config(CircuitBreakerConfig::new(2, Duration::from_secs(30)))
            .build()
            .unwrap();

        for _ in 0..2 {
            let result = orchestrator
                .execute(|| async { Err::<u32, _>(ApiError::server("Error", 503)) })
                .await;
            assert!(matches!(result, Err(ResilienceError::Operation(_))));
        }
        assert_eq!(orchestrator.circuit_breaker().state(), CircuitState::Open);

        let calls = AtomicU32::new(0);
        let result = orchestrator
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, ApiError>(42) }
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        clock.advance(Duration::from_secs(30));
        let result = orchestrator.execute(|| async { Ok::<_, ApiError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(orchestrator.circuit_breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_orchestrator_respects_rate_limit() {
        let clock = Arc::new(ManualClock::new());
        let orchestrator = manual_builder(&clock)
            .rate_limit_config(TokenBucketConfig::per_second(2).with_wait_on_limit(false))
            .build()
            .unwrap();

        for n in 0..2 {
            let result = orchestrator.execute(|| async move { Ok::<_, ApiError>(n) }).await;
            assert!(result.is_ok());
        }

        let result = orchestrator.execute(|| async { Ok::<_, ApiError>(3) }).await;
        assert!(matches!(result, Err(ResilienceError::RateLimited(_))));
    }

    #[tokio::test]
    async fn test_orchestrator_rate_limit_waits() {
        let clock = Arc::new(ManualClock::new());
        let orchestrator = manual_builder(&clock)
            .rate_limit_config(TokenBucketConfig::new(1.0, 1.0))
            .build()
            .unwrap();

        for _ in 0..3 {
            orchestrator
                .execute(|| async { Ok::<_, ApiError>(()) })
                .await
                .unwrap();
        }

        assert_eq!(clock.total_slept(), Duration::from_secs(2));
        assert!(orchestrator.rate_limiter().is_some());
    }

    #[tokio::test]
    async fn test_orchestrator_honours_retry_after() {
        let clock = Arc::new(ManualClock::new());
        let orchestrator = manual_builder(&clock)
            .retry_config(RetryConfig {
                max_retries: 2,
                jitter: 0.0,
                ..Default::default()
            })
            .build()
            .unwrap();

        let attempts = AtomicU32::new(0);
        let result = orchestrator
            .execute(|| {
                let first = attempts.fetch_add(1, Ordering::SeqCst) == 0;
                async move {
                    if first {
                        Err(ApiError::RateLimit {
                            message: "slow down".to_string(),
                            retry_after: Some(Duration::from_secs(5)),
                        })
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(5)]);
        assert!(!orchestrator.retry_after().is_rate_limited("default"));
    }

    #[tokio::test]
    async fn test_orchestrator_builder() {
        let orchestrator = ResilienceOrchestratorBuilder::new()
            .name("billing")
            .retry_config(RetryConfig {
                max_retries: 5,
                ..Default::default()
            })
            .circuit_breaker_config(CircuitBreakerConfig {
                failure_threshold: 10,
                ..Default::default()
            })
            .rate_limit_config(TokenBucketConfig::per_minute(600))
            .build()
            .unwrap();

        assert_eq!(orchestrator.retry_executor().config().max_retries, 5);
        assert_eq!(orchestrator.circuit_breaker().name(), "billing");
        assert_eq!(orchestrator.circuit_breaker().config().failure_threshold, 10);

        let result = orchestrator.execute(|| async { Ok::<_, ApiError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let result = ResilienceOrchestrator::builder()
            .rate_limit_config(TokenBucketConfig::new(0.0, 1.0))
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_passthrough_orchestrator() {
        let orchestrator = ResilienceOrchestrator::passthrough();

        let calls = AtomicU32::new(0);
        let result = orchestrator
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ApiError::server("down", 503)) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(orchestrator.rate_limiter().is_none());
        assert!(!orchestrator.circuit_breaker().is_open());

        let result = orchestrator.execute(|| async { Ok::<_, ApiError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }
}
