use crate::clock::{default_clock, Clock};
use crate::errors::{Classify, ConfigError, ConfigResult};
use crate::{DEFAULT_FAILURE_THRESHOLD, DEFAULT_RESET_TIMEOUT_SECS};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time after the last failure before a probe is let through
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout: Duration::from_secs(DEFAULT_RESET_TIMEOUT_SECS),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            reset_timeout,
        }
    }

    /// Check the configuration's invariants.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold", "must be at least 1"));
        }
        if self.reset_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "reset_timeout",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Circuit breaker state
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed,
    /// Circuit is open, requests are blocked
    Open,
    /// Circuit is half-open, testing if service recovered
    HalfOpen,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub rejected_requests: u64,
    pub times_opened: u64,
    pub time_until_half_open: Option<Duration>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_time: Option<Duration>,
    total_successes: u64,
    total_failures: u64,
    rejected_requests: u64,
    times_opened: u64,
}

impl BreakerState {
    /// Apply the lazy Open -> HalfOpen transition. Returns the transition, if any.
    fn observe(&mut self, now: Duration, reset_timeout: Duration) -> Option<Transition> {
        if self.state != CircuitState::Open {
            return None;
        }
        let last_failure = self.last_failure_time?;
        if now.saturating_sub(last_failure) >= reset_timeout {
            self.state = CircuitState::HalfOpen;
            Some((CircuitState::Open, CircuitState::HalfOpen))
        } else {
            None
        }
    }

    fn remaining_open(&self, now: Duration, reset_timeout: Duration) -> Option<Duration> {
        if self.state != CircuitState::Open {
            return None;
        }
        let elapsed = now.saturating_sub(self.last_failure_time?);
        Some(reset_timeout.saturating_sub(elapsed))
    }
}

type Transition = (CircuitState, CircuitState);

/// Consecutive-failure circuit breaker.
///
/// Opens after `failure_threshold` failures with no success in between. Once
/// `reset_timeout` has passed since the last failure it reads as half-open and
/// lets requests through; the next success closes it and the next failure opens
/// it again. The half-open state is derived on read, there is no timer.
/// Concurrent probes while half-open are not serialized.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerState>,
    hook: Option<Arc<dyn CircuitBreakerHook>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::named("default", config)
    }

    /// Create a named circuit breaker
    pub fn named(name: impl Into<String>, config: CircuitBreakerConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::from_validated(name.into(), config))
    }

    pub(crate) fn from_validated(name: String, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            config,
            clock: default_clock(),
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_time: None,
                total_successes: 0,
                total_failures: 0,
                rejected_requests: 0,
                times_opened: 0,
            }),
            hook: None,
        }
    }

    /// Use a different time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Add a hook for circuit breaker state changes
    pub fn with_hook(mut self, hook: Arc<dyn CircuitBreakerHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Whether a request may be attempted now.
    ///
    /// Rejections are counted in [`CircuitBreakerStats::rejected_requests`].
    pub fn should_allow_request(&self) -> bool {
        let now = self.clock.now();
        let (allowed, transition) = {
            let mut inner = self.inner.lock();
            let transition = inner.observe(now, self.config.reset_timeout);
            let allowed = inner.state != CircuitState::Open;
            if !allowed {
                inner.rejected_requests += 1;
            }
            (allowed, transition)
        };
        self.notify(transition);
        allowed
    }

    /// Check if the circuit breaker is open (blocking requests)
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Get the current state of the circuit breaker
    pub fn state(&self) -> CircuitState {
        let now = self.clock.now();
        let (state, transition) = {
            let mut inner = self.inner.lock();
            let transition = inner.observe(now, self.config.reset_timeout);
            (inner.state, transition)
        };
        self.notify(transition);
        state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Get the time until the circuit transitions to half-open
    pub fn time_until_half_open(&self) -> Option<Duration> {
        let now = self.clock.now();
        self.inner
            .lock()
            .remaining_open(now, self.config.reset_timeout)
    }

    /// Record a successful request. Closes the circuit from any state.
    pub fn record_success(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.total_successes += 1;
            inner.consecutive_failures = 0;
            let old = inner.state;
            inner.state = CircuitState::Closed;
            (old != CircuitState::Closed).then_some((old, CircuitState::Closed))
        };

        if transition.is_some() {
            info!(circuit = %self.name, "Circuit breaker closed");
        }
        self.notify(transition);
    }

    /// Record a failed request.
    pub fn record_failure<E>(&self, error: &E)
    where
        E: Classify + ?Sized,
    {
        let now = self.clock.now();
        let (transition, failures) = {
            let mut inner = self.inner.lock();
            let observed = inner.observe(now, self.config.reset_timeout);

            inner.total_failures += 1;
            inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
            inner.last_failure_time = Some(now);

            let opens = match inner.state {
                CircuitState::HalfOpen => true,
                CircuitState::Closed => {
                    inner.consecutive_failures >= self.config.failure_threshold
                }
                CircuitState::Open => false,
            };

            let transition = if opens {
                let old = inner.state;
                inner.state = CircuitState::Open;
                inner.times_opened += 1;
                Some((old, CircuitState::Open))
            } else {
                None
            };
            (observed.into_iter().chain(transition), inner.consecutive_failures)
        };

        let mut opened = false;
        for transition in transition {
            opened |= transition.1 == CircuitState::Open;
            self.notify(Some(transition));
        }
        if opened {
            warn!(
                circuit = %self.name,
                consecutive_failures = failures,
                kind = error.kind().as_str(),
                reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                "Circuit breaker opened"
            );
        }
    }

    /// Snapshot of this breaker.
    pub fn stats(&self) -> CircuitBreakerStats {
        let now = self.clock.now();
        let (stats, transition) = {
            let mut inner = self.inner.lock();
            let transition = inner.observe(now, self.config.reset_timeout);
            let stats = CircuitBreakerStats {
                name: self.name.clone(),
                state: inner.state,
                consecutive_failures: inner.consecutive_failures,
                total_successes: inner.total_successes,
                total_failures: inner.total_failures,
                rejected_requests: inner.rejected_requests,
                times_opened: inner.times_opened,
                time_until_half_open: inner.remaining_open(now, self.config.reset_timeout),
            };
            (stats, transition)
        };
        self.notify(transition);
        stats
    }

    /// Force the breaker closed and clear its failure history.
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            let old = inner.state;
            inner.state = CircuitState::Closed;
            inner.consecutive_failures = 0;
            inner.last_failure_time = None;
            (old != CircuitState::Closed).then_some((old, CircuitState::Closed))
        };
        self.notify(transition);
    }

    fn notify(&self, transition: Option<Transition>) {
        if let (Some(hook), Some((old, new))) = (&self.hook, transition) {
            hook.on_state_change(&self.name, old, new);
        }
    }
}

/// Hook for circuit breaker state changes
pub trait CircuitBreakerHook: Send + Sync + std::fmt::Debug {
    fn on_state_change(&self, name: &str, old_state: CircuitState, new_state: CircuitState);
}
