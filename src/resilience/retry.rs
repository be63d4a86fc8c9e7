use super::backoff::calculate_delay;
use super::circuit_breaker::CircuitBreaker;
use super::rate_limiter::{AdaptiveRateLimiter, RateLimiter};
use super::retry_after::RetryAfterResolver;
use crate::clock::{default_clock, default_sleeper, Clock, Sleeper};
use crate::errors::{
    Classify, ConfigError, ConfigResult, ErrorKind, ResilienceError, ResilienceResult,
};
use crate::{DEFAULT_JITTER, DEFAULT_MAX_RETRIES, DEFAULT_MAX_RETRY_AFTER_SECS};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Resolver key used when a call names no endpoint.
pub const DEFAULT_ENDPOINT: &str = "default";

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of times the operation is invoked; 0 still invokes once
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Cap for any computed delay
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Jitter fraction in `[0, 1]`; 0 disables jitter
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl RetryConfig {
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::default()
    }

    /// Check the configuration's invariants.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.base_delay.is_zero() {
            return Err(ConfigError::invalid("base_delay", "must be greater than zero"));
        }
        if self.max_delay < self.base_delay {
            return Err(ConfigError::invalid(
                "max_delay",
                "must be at least base_delay",
            ));
        }
        if !(self.multiplier.is_finite() && self.multiplier >= 1.0) {
            return Err(ConfigError::invalid("multiplier", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::invalid("jitter", "must lie within [0, 1]"));
        }
        Ok(())
    }
}

/// Builder for [`RetryConfig`]; `build` validates.
#[derive(Debug, Clone, Default)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl RetryConfigBuilder {
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.config.multiplier = multiplier;
        self
    }

    pub fn jitter(mut self, jitter: f64) -> Self {
        self.config.jitter = jitter;
        self
    }

    /// Enable the default jitter fraction or disable jitter.
    pub fn with_jitter(self, enabled: bool) -> Self {
        self.jitter(if enabled { DEFAULT_JITTER } else { 0.0 })
    }

    pub fn build(self) -> ConfigResult<RetryConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Per-call retry state.
#[derive(Debug)]
pub struct RetryContext<E> {
    /// 1-indexed number of the attempt in progress
    pub current_attempt: u32,
    /// Clock reading when the call started
    pub started_at: Duration,
    last_error: Option<E>,
}

impl<E> RetryContext<E> {
    pub fn new(started_at: Duration) -> Self {
        Self {
            current_attempt: 1,
            started_at,
            last_error: None,
        }
    }

    pub fn total_elapsed(&self, clock: &dyn Clock) -> Duration {
        clock.now().saturating_sub(self.started_at)
    }

    pub fn last_error(&self) -> Option<&E> {
        self.last_error.as_ref()
    }

    fn record_failure(&mut self, error: E) {
        self.last_error = Some(error);
    }
}

type ShouldRetry<E> = Box<dyn Fn(&E, u32) -> bool + Send + Sync>;
type OnRetry<E> = Box<dyn Fn(&E, u32, Duration) + Send + Sync>;

/// Per-call options for [`RetryExecutor::execute_with`].
pub struct ExecuteOptions<E> {
    should_retry: Option<ShouldRetry<E>>,
    on_retry: Option<OnRetry<E>>,
    request_id: Option<String>,
    endpoint: Option<String>,
    signal_exhaustion: bool,
    cancellation: Option<CancellationToken>,
}

impl<E> Default for ExecuteOptions<E> {
    fn default() -> Self {
        Self {
            should_retry: None,
            on_retry: None,
            request_id: None,
            endpoint: None,
            signal_exhaustion: false,
            cancellation: None,
        }
    }
}

impl<E> fmt::Debug for ExecuteOptions<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecuteOptions")
            .field("should_retry", &self.should_retry.is_some())
            .field("on_retry", &self.on_retry.is_some())
            .field("request_id", &self.request_id)
            .field("endpoint", &self.endpoint)
            .field("signal_exhaustion", &self.signal_exhaustion)
            .field("cancellation", &self.cancellation)
            .finish()
    }
}

impl<E> ExecuteOptions<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extra veto on retries. Receives the error and the number of calls made so far.
    pub fn should_retry(mut self, f: impl Fn(&E, u32) -> bool + Send + Sync + 'static) -> Self {
        self.should_retry = Some(Box::new(f));
        self
    }

    /// Called with the error, the failed attempt number and the delay before each retry.
    pub fn on_retry(mut self, f: impl Fn(&E, u32, Duration) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Box::new(f));
        self
    }

    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Key for Retry-After escalation. Success clears the key's state.
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Return `RetryExhausted` instead of the bare last error on exhaustion.
    pub fn signal_exhaustion(mut self, signal: bool) -> Self {
        self.signal_exhaustion = signal;
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .map_or(false, CancellationToken::is_cancelled)
    }
}

/// What a retry hook saw.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryEvent {
    pub attempt: u32,
    pub delay: Duration,
    pub kind: ErrorKind,
    pub error: String,
    pub request_id: Option<String>,
    pub endpoint: Option<String>,
}

/// Decision on how to proceed with a retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Use the default retry behavior
    Default,
    /// Retry with a custom delay
    Retry(Duration),
    /// Abort the retry and return the error
    Abort,
}

/// Hook for custom retry behavior
pub trait RetryHook: Send + Sync {
    fn on_retry(&self, event: &RetryEvent) -> RetryDecision;

    /// Called once when the last permitted attempt fails.
    fn on_exhausted(&self, _event: &RetryEvent) {}
}

enum Next<E> {
    Retry { error: E, delay: Duration },
    Stop(ResilienceError<E>),
}

/// Retry executor that handles retry logic with exponential backoff
///
/// The executor keeps no per-call state, so one instance can serve any number of
/// concurrent calls. Breakers, limiters and resolvers attached to it are shared.
pub struct RetryExecutor {
    config: RetryConfig,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    circuit_breaker: Option<Arc<CircuitBreaker>>,
    retry_after: Option<Arc<RetryAfterResolver>>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    adaptive: Option<Arc<AdaptiveRateLimiter>>,
    retry_hook: Option<Arc<dyn RetryHook>>,
}

impl RetryExecutor {
    /// Create a new retry executor with the given configuration
    pub fn new(config: RetryConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::from_validated(config))
    }

    pub(crate) fn from_validated(config: RetryConfig) -> Self {
        Self {
            config,
            clock: default_clock(),
            sleeper: default_sleeper(),
            circuit_breaker: None,
            retry_after: None,
            rate_limiter: None,
            adaptive: None,
            retry_hook: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Gate every attempt on `breaker` and report outcomes to it.
    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.circuit_breaker = Some(breaker);
        self
    }

    /// Escalate server wait hints per endpoint through `resolver`.
    pub fn with_retry_after(mut self, resolver: Arc<RetryAfterResolver>) -> Self {
        self.retry_after = Some(resolver);
        self
    }

    /// Acquire one permit from `limiter` before every attempt.
    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Feed rate-limit hits and successes to `limiter`.
    pub fn with_adaptive_limiter(mut self, limiter: Arc<AdaptiveRateLimiter>) -> Self {
        self.adaptive = Some(limiter);
        self
    }

    /// Add a retry hook for custom retry logic
    pub fn with_hook(mut self, hook: Arc<dyn RetryHook>) -> Self {
        self.retry_hook = Some(hook);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute the given operation with retry logic
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        self.execute_with(ExecuteOptions::default(), operation).await
    }

    /// Execute the given operation with retry logic and per-call options
    pub async fn execute_with<F, Fut, T, E>(
        &self,
        options: ExecuteOptions<E>,
        mut operation: F,
    ) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        let mut context = RetryContext::new(self.clock.now());

        loop {
            self.before_attempt(&context, &options)?;

            if let Some(limiter) = &self.rate_limiter {
                match cancellable(options.cancellation.as_ref(), limiter.acquire(1)).await {
                    Some(acquired) => acquired?,
                    None => return Err(cancelled(&context)),
                }
            }

            let error = match operation().await {
                Ok(value) => {
                    self.after_success(&options);
                    return Ok(value);
                }
                Err(error) => error,
            };

            match self.after_failure(&context, &options, error) {
                Next::Stop(error) => return Err(error),
                Next::Retry { error, delay } => {
                    context.record_failure(error);
                    let slept = cancellable(options.cancellation.as_ref(), self.sleeper.sleep(delay));
                    if slept.await.is_none() {
                        return Err(ResilienceError::Cancelled {
                            attempts: context.current_attempt,
                        });
                    }
                    context.current_attempt += 1;
                }
            }
        }
    }

    /// Execute a synchronous operation with retry logic, blocking between attempts.
    ///
    /// Cancellation is checked before each attempt and after each delay.
    pub fn execute_blocking<F, T, E>(
        &self,
        options: ExecuteOptions<E>,
        mut operation: F,
    ) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: Classify + fmt::Display,
    {
        let mut context = RetryContext::new(self.clock.now());

        loop {
            self.before_attempt(&context, &options)?;

            if let Some(limiter) = &self.rate_limiter {
                limiter.acquire_blocking(1)?;
            }

            let error = match operation() {
                Ok(value) => {
                    self.after_success(&options);
                    return Ok(value);
                }
                Err(error) => error,
            };

            match self.after_failure(&context, &options, error) {
                Next::Stop(error) => return Err(error),
                Next::Retry { error, delay } => {
                    context.record_failure(error);
                    let completed = match &options.cancellation {
                        Some(token) => self.sleeper.sleep_blocking_cancellable(delay, token),
                        None => {
                            self.sleeper.sleep_blocking(delay);
                            true
                        }
                    };
                    if !completed {
                        return Err(ResilienceError::Cancelled {
                            attempts: context.current_attempt,
                        });
                    }
                    context.current_attempt += 1;
                }
            }
        }
    }

    fn before_attempt<E>(
        &self,
        context: &RetryContext<E>,
        options: &ExecuteOptions<E>,
    ) -> ResilienceResult<(), E> {
        if options.is_cancelled() {
            return Err(cancelled(context));
        }

        if let Some(breaker) = &self.circuit_breaker {
            if !breaker.should_allow_request() {
                debug!(
                    circuit = %breaker.name(),
                    attempt = context.current_attempt,
                    "Circuit open, not attempting"
                );
                return Err(ResilienceError::CircuitOpen {
                    name: breaker.name().to_string(),
                    retry_in: breaker.time_until_half_open(),
                });
            }
        }
        Ok(())
    }

    fn after_success<E>(&self, options: &ExecuteOptions<E>) {
        if let Some(breaker) = &self.circuit_breaker {
            breaker.record_success();
        }
        if let Some(adaptive) = &self.adaptive {
            adaptive.record_success();
        }
        if let Some(resolver) = &self.retry_after {
            resolver.clear_rate_limit(options.endpoint.as_deref().unwrap_or(DEFAULT_ENDPOINT));
        }
    }

    fn after_failure<E>(
        &self,
        context: &RetryContext<E>,
        options: &ExecuteOptions<E>,
        error: E,
    ) -> Next<E>
    where
        E: Classify + fmt::Display,
    {
        let attempt = context.current_attempt;
        let kind = error.kind();

        // Client faults say nothing about the dependency's health.
        if kind.is_retryable() {
            if let Some(breaker) = &self.circuit_breaker {
                breaker.record_failure(&kind);
            }
        }
        if kind.is_rate_limit() {
            if let Some(adaptive) = &self.adaptive {
                adaptive.record_rate_limit_hit();
            }
        }

        let retryable = kind.is_retryable()
            && options
                .should_retry
                .as_ref()
                .map_or(true, |should_retry| should_retry(&error, attempt));
        if !retryable {
            debug!(attempt, kind = kind.as_str(), "Error is not retryable");
            return Next::Stop(ResilienceError::Operation(error));
        }

        if attempt >= self.config.max_retries {
            warn!(
                attempts = attempt,
                kind = kind.as_str(),
                error = %error,
                request_id = ?options.request_id,
                "Retry attempts exhausted"
            );
            if let Some(hook) = &self.retry_hook {
                hook.on_exhausted(&event(attempt, Duration::ZERO, kind, &error, options));
            }
            return Next::Stop(if options.signal_exhaustion {
                ResilienceError::RetryExhausted {
                    attempts: attempt,
                    last_error: error,
                    request_id: options.request_id.clone(),
                    elapsed: context.total_elapsed(self.clock.as_ref()),
                }
            } else {
                ResilienceError::Operation(error)
            });
        }

        let mut delay = self.retry_delay(attempt, kind, options.endpoint.as_deref());

        if let Some(hook) = &self.retry_hook {
            match hook.on_retry(&event(attempt, delay, kind, &error, options)) {
                RetryDecision::Abort => return Next::Stop(ResilienceError::Operation(error)),
                RetryDecision::Retry(custom_delay) => delay = custom_delay,
                RetryDecision::Default => {}
            }
        }

        if let Some(on_retry) = &options.on_retry {
            on_retry(&error, attempt, delay);
        }

        debug!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            kind = kind.as_str(),
            error = %error,
            request_id = ?options.request_id,
            "Retrying operation"
        );
        Next::Retry { error, delay }
    }

    /// Delay before the retry that follows failed attempt `attempt`.
    fn retry_delay(&self, attempt: u32, kind: ErrorKind, endpoint: Option<&str>) -> Duration {
        match (kind.retry_after(), &self.retry_after) {
            (Some(hint), Some(resolver)) => {
                resolver.record_rate_limit(endpoint.unwrap_or(DEFAULT_ENDPOINT), Some(hint))
            }
            (Some(hint), None) => hint.min(Duration::from_secs(DEFAULT_MAX_RETRY_AFTER_SECS)),
            (None, _) => calculate_delay(attempt.saturating_sub(1), &self.config),
        }
    }
}

fn event<E: fmt::Display>(
    attempt: u32,
    delay: Duration,
    kind: ErrorKind,
    error: &E,
    options: &ExecuteOptions<E>,
) -> RetryEvent {
    RetryEvent {
        attempt,
        delay,
        kind,
        error: error.to_string(),
        request_id: options.request_id.clone(),
        endpoint: options.endpoint.clone(),
    }
}

fn cancelled<E>(context: &RetryContext<E>) -> ResilienceError<E> {
    ResilienceError::Cancelled {
        attempts: context.current_attempt - 1,
    }
}

/// Run `future` unless `token` fires first.
async fn cancellable<F>(token: Option<&CancellationToken>, future: F) -> Option<F::Output>
where
    F: Future,
{
    match token {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => None,
            output = future => Some(output),
        },
        None => Some(future.await),
    }
}
