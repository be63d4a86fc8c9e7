//! # Resilience primitives for API clients
//!
//! Retry, circuit breaking, rate limiting and Retry-After handling for calls to
//! remote services, with every time-dependent decision routed through an
//! injectable clock.
//!
//! ## Features
//!
//! - Retry executor with exponential backoff, jitter and cancellation
//! - Three-state circuit breaker that counts only transient failures
//! - Token bucket, sliding window, adaptive (AIMD) and composite rate limiters
//! - Retry-After parsing (delay-seconds and HTTP-dates) with per-endpoint
//!   escalation on consecutive 429 responses
//! - Structured logging through `tracing`, plus a pluggable metrics sink
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use integrations_resilience::{ApiError, ResilienceConfig, ResilienceOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let orchestrator = ResilienceOrchestrator::new(ResilienceConfig::from_env()?)?;
//!
//!     let body = orchestrator
//!         .execute(|| async {
//!             // Issue the request here and map failures onto `ApiError`.
//!             Ok::<_, ApiError>("ok")
//!         })
//!         .await?;
//!     println!("{body}");
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - `clock` - Time source and sleep abstraction, including a manual clock
//! - `config` - Aggregated configuration and environment loading
//! - `errors` - Error classification and error types
//! - `resilience` - Retry, circuit breaker, rate limiters and Retry-After
//! - `observability` - Logging setup and metrics hooks

#![warn(clippy::all)]

pub mod clock;
pub mod config;
pub mod errors;
pub mod observability;
pub mod resilience;

pub use clock::{Clock, ManualClock, Sleeper, SystemClock, TokioSleeper};
pub use config::{ResilienceConfig, ResilienceConfigBuilder};
pub use errors::{
    ApiError, Classify, ConfigError, ConfigResult, ErrorCategory, ErrorKind, RateLimitError,
    ResilienceError, ResilienceResult,
};
pub use observability::{
    InMemoryMetricsCollector, LogFormat, LogLevel, LoggingConfig, MetricsCircuitBreakerHook,
    MetricsCollector, MetricsRetryHook, NoopMetricsCollector,
};
pub use resilience::{
    AdaptiveConfig, AdaptiveRateLimiter, CircuitBreaker, CircuitBreakerConfig, CircuitState,
    CompositeRateLimiter, EndpointRateLimiters, ExecuteOptions, RateLimitHeaders, RateLimiter,
    ResilienceOrchestrator, RetryAfterConfig, RetryAfterResolver, RetryConfig, RetryExecutor,
    RetryHook, SlidingWindow, SlidingWindowConfig, TokenBucket, TokenBucketConfig,
};

/// The default maximum number of invocations per call
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// The default jitter fraction applied to backoff delays
pub const DEFAULT_JITTER: f64 = 0.1;

/// Consecutive failures that open a circuit by default
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default time an open circuit waits before letting a probe through
pub const DEFAULT_RESET_TIMEOUT_SECS: u64 = 30;

/// Wait used for a 429 that carries no usable Retry-After
pub const DEFAULT_DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Upper bound for any Retry-After wait
pub const DEFAULT_MAX_RETRY_AFTER_SECS: u64 = 3600;
