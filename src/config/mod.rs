//! Configuration for the resilience stack.

use crate::errors::{ConfigError, ConfigResult};
use crate::resilience::{
    CircuitBreakerConfig, RetryAfterConfig, RetryConfig, TokenBucketConfig,
};
use std::str::FromStr;
use std::time::Duration;

/// Aggregated configuration for a [`ResilienceOrchestrator`](crate::ResilienceOrchestrator).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResilienceConfig {
    /// Retry and backoff behavior
    pub retry: RetryConfig,
    /// Circuit breaker thresholds
    pub circuit_breaker: CircuitBreakerConfig,
    /// Client-side token bucket; `None` disables client-side limiting
    pub rate_limit: Option<TokenBucketConfig>,
    /// Retry-After defaults and ceiling
    pub retry_after: RetryAfterConfig,
}

impl ResilienceConfig {
    /// Creates a new configuration builder
    pub fn builder() -> ResilienceConfigBuilder {
        ResilienceConfigBuilder::default()
    }

    /// Creates a configuration from `RESILIENCE_*` environment variables.
    ///
    /// Unset variables keep their defaults. A client-side rate limit is only
    /// configured when `RESILIENCE_RATE_LIMIT_CAPACITY` is set.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`ResilienceConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup<L>(lookup: L) -> ConfigResult<Self>
    where
        L: Fn(&str) -> Option<String>,
    {
        let mut builder = Self::builder();
        let mut retry = RetryConfig::default();
        let mut breaker = CircuitBreakerConfig::default();
        let mut retry_after = RetryAfterConfig::default();

        if let Some(v) = parse_var(&lookup, "RESILIENCE_MAX_RETRIES")? {
            retry.max_retries = v;
        }
        if let Some(ms) = parse_var(&lookup, "RESILIENCE_BASE_DELAY_MS")? {
            retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "RESILIENCE_MAX_DELAY_MS")? {
            retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(v) = parse_var(&lookup, "RESILIENCE_MULTIPLIER")? {
            retry.multiplier = v;
        }
        if let Some(v) = parse_var(&lookup, "RESILIENCE_JITTER")? {
            retry.jitter = v;
        }
        if let Some(v) = parse_var(&lookup, "RESILIENCE_FAILURE_THRESHOLD")? {
            breaker.failure_threshold = v;
        }
        if let Some(ms) = parse_var(&lookup, "RESILIENCE_RESET_TIMEOUT_MS")? {
            breaker.reset_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var(&lookup, "RESILIENCE_DEFAULT_RETRY_AFTER_SECS")? {
            retry_after.default_retry_after = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&lookup, "RESILIENCE_MAX_RETRY_AFTER_SECS")? {
            retry_after.max_retry_after = Duration::from_secs(secs);
        }

        if let Some(capacity) = parse_var::<f64, _>(&lookup, "RESILIENCE_RATE_LIMIT_CAPACITY")? {
            let refill_rate =
                parse_var(&lookup, "RESILIENCE_RATE_LIMIT_REFILL_RATE")?.unwrap_or(capacity);
            builder = builder.rate_limit(TokenBucketConfig::new(capacity, refill_rate));
        }

        builder
            .retry(retry)
            .circuit_breaker(breaker)
            .retry_after(retry_after)
            .build()
    }

    /// Check every component configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        self.retry.validate()?;
        self.circuit_breaker.validate()?;
        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.validate()?;
        }
        self.retry_after.validate()
    }
}

fn parse_var<T, L>(lookup: &L, var: &str) -> ConfigResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    L: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Environment {
                var: var.to_string(),
                message: e.to_string(),
            }),
    }
}

/// Builder for [`ResilienceConfig`]
#[derive(Debug, Clone, Default)]
pub struct ResilienceConfigBuilder {
    config: ResilienceConfig,
}

impl ResilienceConfigBuilder {
    /// Sets the retry configuration
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.config.retry = config;
        self
    }

    /// Sets the maximum number of invocations
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.retry.max_retries = max_retries;
        self
    }

    /// Sets the circuit breaker configuration
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.config.circuit_breaker = config;
        self
    }

    /// Enables a client-side token bucket
    pub fn rate_limit(mut self, config: TokenBucketConfig) -> Self {
        self.config.rate_limit = Some(config);
        self
    }

    /// Disables client-side rate limiting
    pub fn without_rate_limit(mut self) -> Self {
        self.config.rate_limit = None;
        self
    }

    /// Sets the Retry-After configuration
    pub fn retry_after(mut self, config: RetryAfterConfig) -> Self {
        self.config.retry_after = config;
        self
    }

    /// Builds and validates the configuration
    pub fn build(self) -> ConfigResult<ResilienceConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
