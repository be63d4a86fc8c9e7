//! Retry-After parsing and per-endpoint 429 escalation.

use crate::clock::{default_clock, Clock};
use crate::errors::{ConfigError, ConfigResult};
use crate::{DEFAULT_DEFAULT_RETRY_AFTER_SECS, DEFAULT_MAX_RETRY_AFTER_SECS};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::hash::BuildHasher;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Name of the header carrying the server's wait hint.
pub const RETRY_AFTER: &str = "retry-after";

/// Case-insensitive read access to response headers.
pub trait HeaderSource {
    /// Look up a header value by name, ignoring ASCII case.
    fn header(&self, name: &str) -> Option<&str>;
}

impl HeaderSource for http::HeaderMap {
    fn header(&self, name: &str) -> Option<&str> {
        self.get(name.to_ascii_lowercase().as_str())
            .and_then(|v| v.to_str().ok())
    }
}

impl<S: BuildHasher> HeaderSource for HashMap<String, String, S> {
    fn header(&self, name: &str) -> Option<&str> {
        self.iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

impl HeaderSource for BTreeMap<String, String> {
    fn header(&self, name: &str) -> Option<&str> {
        self.iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

impl<'a> HeaderSource for [(&'a str, &'a str)] {
    fn header(&self, name: &str) -> Option<&str> {
        self.iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| *value)
    }
}

impl<T: HeaderSource + ?Sized> HeaderSource for &T {
    fn header(&self, name: &str) -> Option<&str> {
        (**self).header(name)
    }
}

/// Read the `Retry-After` header relative to the system wall clock.
///
/// Returns `None` when the header is missing or malformed.
pub fn parse_retry_after<H>(headers: &H) -> Option<Duration>
where
    H: HeaderSource + ?Sized,
{
    headers
        .header(RETRY_AFTER)
        .and_then(|value| parse_retry_after_value(value, Utc::now()))
}

/// Parse a single `Retry-After` value.
///
/// Accepts delay-seconds (negative values clamp to zero) or an HTTP-date in
/// IMF-fixdate, RFC 850 or asctime form. Dates in the past yield zero.
pub fn parse_retry_after_value(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let (negative, digits) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value.strip_prefix('+').unwrap_or(value)),
    };
    if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
        if negative {
            return Some(Duration::ZERO);
        }
        // Only overflow can fail here; saturate instead of treating it as malformed.
        return Some(Duration::from_secs(digits.parse().unwrap_or(u64::MAX)));
    }

    let date = parse_http_date(value)?;
    Some((date - now).to_std().unwrap_or(Duration::ZERO))
}

/// Parse an HTTP-date.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        return Some(date.with_timezone(&Utc));
    }

    // RFC 850, then asctime
    ["%A, %d-%b-%y %H:%M:%S GMT", "%a %b %e %H:%M:%S %Y"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Configuration for [`RetryAfterResolver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryAfterConfig {
    /// Wait used when a 429 carries no usable hint
    pub default_retry_after: Duration,
    /// Absolute ceiling for any computed wait
    pub max_retry_after: Duration,
}

impl Default for RetryAfterConfig {
    fn default() -> Self {
        Self {
            default_retry_after: Duration::from_secs(DEFAULT_DEFAULT_RETRY_AFTER_SECS),
            max_retry_after: Duration::from_secs(DEFAULT_MAX_RETRY_AFTER_SECS),
        }
    }
}

impl RetryAfterConfig {
    /// Set the fallback wait.
    pub fn with_default_retry_after(mut self, wait: Duration) -> Self {
        self.default_retry_after = wait;
        self
    }

    /// Set the wait ceiling.
    pub fn with_max_retry_after(mut self, wait: Duration) -> Self {
        self.max_retry_after = wait;
        self
    }

    /// Check the configuration's invariants.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_retry_after.is_zero() {
            return Err(ConfigError::invalid(
                "max_retry_after",
                "must be greater than zero",
            ));
        }
        if self.default_retry_after > self.max_retry_after {
            return Err(ConfigError::invalid(
                "default_retry_after",
                "must not exceed max_retry_after",
            ));
        }
        Ok(())
    }
}

/// Snapshot of an endpoint's rate-limit state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitState {
    pub is_limited: bool,
    pub retry_after: Duration,
    pub blocked_until: Option<DateTime<Utc>>,
    pub consecutive_429s: u32,
}

impl RateLimitState {
    fn unlimited() -> Self {
        Self {
            is_limited: false,
            retry_after: Duration::ZERO,
            blocked_until: None,
            consecutive_429s: 0,
        }
    }
}

#[derive(Debug, Default)]
struct EndpointState {
    consecutive_429s: u32,
    retry_after: Duration,
    blocked_until: Duration,
}

/// Resolves server wait hints and escalates repeated 429s per endpoint.
///
/// Each consecutive 429 on the same endpoint multiplies the wait linearly:
/// with a 30s hint, three hits in a row wait 30s, 60s and 90s. A recorded
/// success resets the endpoint so the next 429 starts over.
#[derive(Debug)]
pub struct RetryAfterResolver {
    config: RetryAfterConfig,
    clock: Arc<dyn Clock>,
    endpoints: Mutex<HashMap<String, EndpointState>>,
}

impl RetryAfterResolver {
    /// Create a resolver backed by the system clock.
    pub fn new(config: RetryAfterConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::from_validated(config))
    }

    pub(crate) fn from_validated(config: RetryAfterConfig) -> Self {
        Self {
            config,
            clock: default_clock(),
            endpoints: Mutex::new(HashMap::new()),
        }
    }

    /// Use a different time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &RetryAfterConfig {
        &self.config
    }

    /// Parse `Retry-After` from `headers`, relative to this resolver's clock.
    pub fn parse<H>(&self, headers: &H) -> Option<Duration>
    where
        H: HeaderSource + ?Sized,
    {
        headers
            .header(RETRY_AFTER)
            .and_then(|value| parse_retry_after_value(value, self.clock.wall_clock()))
    }

    /// Parse `Retry-After`, falling back to the default wait, capped.
    pub fn resolve<H>(&self, headers: &H) -> Duration
    where
        H: HeaderSource + ?Sized,
    {
        self.parse(headers)
            .unwrap_or(self.config.default_retry_after)
            .min(self.config.max_retry_after)
    }

    /// Record a 429 for `endpoint` and return how long to wait.
    pub fn record_rate_limit(&self, endpoint: &str, retry_after: Option<Duration>) -> Duration {
        let now = self.clock.now();
        let base = retry_after.unwrap_or(self.config.default_retry_after);

        let (wait, consecutive) = {
            let mut endpoints = self.endpoints.lock();
            let state = endpoints.entry(endpoint.to_string()).or_default();
            state.consecutive_429s = state.consecutive_429s.saturating_add(1);

            let wait = base
                .checked_mul(state.consecutive_429s)
                .unwrap_or(self.config.max_retry_after)
                .min(self.config.max_retry_after);
            state.retry_after = wait;
            state.blocked_until = now.saturating_add(wait);
            (wait, state.consecutive_429s)
        };

        warn!(
            endpoint,
            consecutive_429s = consecutive,
            wait_ms = wait.as_millis() as u64,
            "Rate limited by server"
        );
        wait
    }

    /// Forget every 429 recorded for `endpoint`.
    pub fn clear_rate_limit(&self, endpoint: &str) {
        if self.endpoints.lock().remove(endpoint).is_some() {
            debug!(endpoint, "Rate limit cleared");
        }
    }

    /// Whether `endpoint` is still inside its blocked window.
    pub fn is_rate_limited(&self, endpoint: &str) -> bool {
        !self.remaining_wait(endpoint).is_zero()
    }

    /// Time left in `endpoint`'s blocked window.
    pub fn remaining_wait(&self, endpoint: &str) -> Duration {
        let now = self.clock.now();
        self.endpoints
            .lock()
            .get(endpoint)
            .map(|state| state.blocked_until.saturating_sub(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Snapshot of `endpoint`'s state.
    pub fn state(&self, endpoint: &str) -> RateLimitState {
        let now = self.clock.now();
        let wall = self.clock.wall_clock();
        let endpoints = self.endpoints.lock();

        match endpoints.get(endpoint) {
            Some(state) => {
                let remaining = state.blocked_until.saturating_sub(now);
                RateLimitState {
                    is_limited: !remaining.is_zero(),
                    retry_after: state.retry_after,
                    blocked_until: chrono::Duration::from_std(remaining)
                        .ok()
                        .filter(|_| !remaining.is_zero())
                        .map(|offset| wall + offset),
                    consecutive_429s: state.consecutive_429s,
                }
            }
            None => RateLimitState::unlimited(),
        }
    }
}
