//! Metrics collection for retries, breakers and limiters.
//!
//! [`MetricsCollector`] is a minimal sink. [`MetricsRetryHook`] and
//! [`MetricsCircuitBreakerHook`] plug it into the executor and breaker hooks,
//! and [`record_limiter_stats`] publishes limiter snapshots as gauges.

use crate::resilience::{
    CircuitBreakerHook, CircuitState, RateLimiterStats, RetryDecision, RetryEvent, RetryHook,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Metrics collector for tracking resilience behavior.
pub trait MetricsCollector: Send + Sync {
    /// Increments a counter by the given value.
    fn increment_counter(&self, name: &str, value: u64, labels: &[(&str, &str)]);

    /// Records a value in a histogram.
    fn record_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]);

    /// Sets a gauge to the given value.
    fn set_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]);
}

/// In-memory metrics collector for testing and simple use cases.
///
/// Labelled series are stored under `name:k1=v1,k2=v2`.
#[derive(Debug, Default)]
pub struct InMemoryMetricsCollector {
    counters: RwLock<HashMap<String, AtomicU64>>,
    histograms: RwLock<HashMap<String, Vec<f64>>>,
    gauges: RwLock<HashMap<String, f64>>,
}

impl InMemoryMetricsCollector {
    /// Creates a new in-memory metrics collector.
    ///
    /// # Examples
    ///
    /// ```
    /// use integrations_resilience::observability::{InMemoryMetricsCollector, MetricsCollector};
    ///
    /// let collector = InMemoryMetricsCollector::new();
    /// collector.increment_counter("retries", 1, &[]);
    /// assert_eq!(collector.get_counter("retries"), 1);
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter; 0 if it was never incremented.
    pub fn get_counter(&self, name: &str) -> u64 {
        self.counters
            .read()
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Every value recorded for a histogram, in order.
    pub fn get_histogram(&self, name: &str) -> Vec<f64> {
        self.histograms
            .read()
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn get_gauge(&self, name: &str) -> Option<f64> {
        self.gauges.read().get(name).copied()
    }

    /// Resets all metrics.
    pub fn reset(&self) {
        self.counters.write().clear();
        self.histograms.write().clear();
        self.gauges.write().clear();
    }

    fn make_key(name: &str, labels: &[(&str, &str)]) -> String {
        if labels.is_empty() {
            return name.to_string();
        }
        let labels: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
        format!("{}:{}", name, labels.join(","))
    }
}

impl MetricsCollector for InMemoryMetricsCollector {
    fn increment_counter(&self, name: &str, value: u64, labels: &[(&str, &str)]) {
        let key = Self::make_key(name, labels);
        if let Some(counter) = self.counters.read().get(&key) {
            counter.fetch_add(value, Ordering::Relaxed);
            return;
        }
        self.counters
            .write()
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(value, Ordering::Relaxed);
    }

    fn record_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        let key = Self::make_key(name, labels);
        self.histograms.write().entry(key).or_default().push(value);
    }

    fn set_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        let key = Self::make_key(name, labels);
        self.gauges.write().insert(key, value);
    }
}

/// Discards all metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsCollector;

impl MetricsCollector for NoopMetricsCollector {
    fn increment_counter(&self, _name: &str, _value: u64, _labels: &[(&str, &str)]) {}
    fn record_histogram(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) {}
    fn set_gauge(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) {}
}

/// Standard metric names.
pub mod metric_names {
    /// Retries scheduled, labelled by error kind
    pub const RETRY_ATTEMPTS: &str = "resilience.retry.attempts";

    /// Scheduled retry delays in milliseconds
    pub const RETRY_DELAY_MS: &str = "resilience.retry.delay_ms";

    /// Calls that used up every permitted attempt
    pub const RETRY_EXHAUSTED: &str = "resilience.retry.exhausted";

    /// Server-side rate limit responses
    pub const RATE_LIMIT_HITS: &str = "resilience.rate_limit.hits";

    /// Tokens (or window slots) currently available, per limiter
    pub const RATE_LIMIT_AVAILABLE: &str = "resilience.rate_limit.available";

    /// Acquisitions refused by a limiter
    pub const RATE_LIMIT_REJECTED: &str = "resilience.rate_limit.rejected";

    /// Current state of a circuit breaker (0=closed, 1=open, 2=half-open)
    pub const CIRCUIT_BREAKER_STATE: &str = "resilience.circuit_breaker.state";

    /// Circuit breaker state transitions, labelled by target state
    pub const CIRCUIT_BREAKER_TRANSITIONS: &str = "resilience.circuit_breaker.transitions";
}

/// Gauge value for a breaker state.
pub fn circuit_state_value(state: CircuitState) -> f64 {
    match state {
        CircuitState::Closed => 0.0,
        CircuitState::Open => 1.0,
        CircuitState::HalfOpen => 2.0,
    }
}

fn circuit_state_label(state: CircuitState) -> &'static str {
    match state {
        CircuitState::Closed => "closed",
        CircuitState::Open => "open",
        CircuitState::HalfOpen => "half_open",
    }
}

/// Publish a limiter snapshot as gauges labelled with the limiter name.
pub fn record_limiter_stats(collector: &dyn MetricsCollector, stats: &RateLimiterStats) {
    let labels = [("limiter", stats.name.as_str())];
    collector.set_gauge(metric_names::RATE_LIMIT_AVAILABLE, stats.available, &labels);
    collector.set_gauge(
        metric_names::RATE_LIMIT_REJECTED,
        stats.rejected as f64,
        &labels,
    );
}

/// Retry hook that records every retry and exhaustion. It never changes the
/// executor's decision.
#[derive(Clone)]
pub struct MetricsRetryHook {
    collector: Arc<dyn MetricsCollector>,
}

impl MetricsRetryHook {
    pub fn new(collector: Arc<dyn MetricsCollector>) -> Self {
        Self { collector }
    }
}

impl fmt::Debug for MetricsRetryHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsRetryHook").finish_non_exhaustive()
    }
}

impl RetryHook for MetricsRetryHook {
    fn on_retry(&self, event: &RetryEvent) -> RetryDecision {
        let endpoint = event.endpoint.as_deref().unwrap_or("default");
        let labels = [("kind", event.kind.as_str()), ("endpoint", endpoint)];

        self.collector
            .increment_counter(metric_names::RETRY_ATTEMPTS, 1, &labels);
        self.collector.record_histogram(
            metric_names::RETRY_DELAY_MS,
            event.delay.as_secs_f64() * 1000.0,
            &labels,
        );
        if event.kind.is_rate_limit() {
            self.collector
                .increment_counter(metric_names::RATE_LIMIT_HITS, 1, &[("endpoint", endpoint)]);
        }
        RetryDecision::Default
    }

    fn on_exhausted(&self, event: &RetryEvent) {
        let endpoint = event.endpoint.as_deref().unwrap_or("default");
        self.collector.increment_counter(
            metric_names::RETRY_EXHAUSTED,
            1,
            &[("kind", event.kind.as_str()), ("endpoint", endpoint)],
        );
    }
}

/// Circuit breaker hook that tracks state as a gauge and counts transitions.
#[derive(Clone)]
pub struct MetricsCircuitBreakerHook {
    collector: Arc<dyn MetricsCollector>,
}

impl MetricsCircuitBreakerHook {
    pub fn new(collector: Arc<dyn MetricsCollector>) -> Self {
        Self { collector }
    }
}

impl fmt::Debug for MetricsCircuitBreakerHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsCircuitBreakerHook")
            .finish_non_exhaustive()
    }
}

impl CircuitBreakerHook for MetricsCircuitBreakerHook {
    fn on_state_change(&self, name: &str, _old_state: CircuitState, new_state: CircuitState) {
        self.collector.set_gauge(
            metric_names::CIRCUIT_BREAKER_STATE,
            circuit_state_value(new_state),
            &[("circuit", name)],
        );
        self.collector.increment_counter(
            metric_names::CIRCUIT_BREAKER_TRANSITIONS,
            1,
            &[("circuit", name), ("to", circuit_state_label(new_state))],
        );
    }
}
