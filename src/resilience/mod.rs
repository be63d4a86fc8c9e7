//! Retry, circuit breaking, rate limiting and Retry-After handling.

pub(crate) mod backoff;
pub(crate) mod circuit_breaker;
pub(crate) mod orchestrator;
pub(crate) mod rate_limiter;
pub(crate) mod retry;
pub(crate) mod retry_after;

#[cfg(test)]
mod tests;

pub use backoff::{calculate_delay, calculate_delay_with_rng, estimate_total_wait};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerHook, CircuitBreakerStats, CircuitState,
};
pub use orchestrator::{ResilienceOrchestrator, ResilienceOrchestratorBuilder};
pub use rate_limiter::{
    AdaptiveConfig, AdaptiveRateLimiter, CompositeRateLimiter, EndpointRateLimiters,
    RateLimitHeaders, RateLimiter, RateLimiterStats, SlidingWindow, SlidingWindowConfig,
    TokenBucket, TokenBucketConfig,
};
pub use retry::{
    ExecuteOptions, RetryConfig, RetryConfigBuilder, RetryContext, RetryDecision, RetryEvent,
    RetryExecutor, RetryHook, DEFAULT_ENDPOINT,
};
pub use retry_after::{
    parse_http_date, parse_retry_after, parse_retry_after_value, HeaderSource, RateLimitState,
    RetryAfterConfig, RetryAfterResolver, RETRY_AFTER,
};
