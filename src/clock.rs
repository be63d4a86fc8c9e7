//! Time sources and sleep primitives.
//!
//! Every time-dependent component in this crate reads time through [`Clock`] and
//! suspends through [`Sleeper`], so the same code runs against the system clock in
//! production and against a [`ManualClock`] in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Longest uninterrupted slice of a cancellable blocking sleep.
const BLOCKING_SLICE: Duration = Duration::from_millis(50);

/// Monotonic time source.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Time elapsed since the clock's epoch. Never decreases.
    fn now(&self) -> Duration;

    /// Current wall-clock time, used for HTTP-date arithmetic only.
    fn wall_clock(&self) -> DateTime<Utc>;
}

/// Suspension primitive for both async and thread-per-call callers.
#[async_trait]
pub trait Sleeper: Send + Sync + fmt::Debug {
    /// Suspend the current task for `duration`.
    async fn sleep(&self, duration: Duration);

    /// Block the current thread for `duration`.
    fn sleep_blocking(&self, duration: Duration);

    /// Block for up to `duration`, waking early once `token` fires.
    ///
    /// Returns `false` if the sleep was cut short (or never started) because of
    /// cancellation.
    fn sleep_blocking_cancellable(&self, duration: Duration, token: &CancellationToken) -> bool {
        let mut remaining = duration;
        while !token.is_cancelled() {
            if remaining.is_zero() {
                return true;
            }
            let slice = remaining.min(BLOCKING_SLICE);
            self.sleep_blocking(slice);
            remaining -= slice;
        }
        false
    }
}

/// Clock backed by [`Instant`] and the system wall clock.
#[derive(Debug, Clone)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    /// Create a clock whose epoch is the moment of construction.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn wall_clock(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Sleeper backed by `tokio::time::sleep` and `std::thread::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }

    fn sleep_blocking(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Deterministic clock for tests.
///
/// Sleeping on a `ManualClock` returns immediately, advances the clock by the
/// requested duration and records it, so tests can assert on exact delays.
#[derive(Debug)]
pub struct ManualClock {
    inner: Mutex<ManualClockState>,
}

#[derive(Debug)]
struct ManualClockState {
    elapsed: Duration,
    wall_base: DateTime<Utc>,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    /// Create a manual clock at elapsed zero, with the wall clock set to now.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Create a manual clock whose wall clock starts at `wall`.
    pub fn starting_at(wall: DateTime<Utc>) -> Self {
        Self {
            inner: Mutex::new(ManualClockState {
                elapsed: Duration::ZERO,
                wall_base: wall,
                sleeps: Vec::new(),
            }),
        }
    }

    /// Move time forward.
    pub fn advance(&self, duration: Duration) {
        let mut inner = self.inner.lock();
        inner.elapsed = inner.elapsed.saturating_add(duration);
    }

    /// Move the wall clock to `wall` without touching monotonic time.
    pub fn set_wall_clock(&self, wall: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        let offset =
            chrono::Duration::from_std(inner.elapsed).unwrap_or_else(|_| chrono::Duration::zero());
        inner.wall_base = wall - offset;
    }

    /// Every duration passed to `sleep`/`sleep_blocking`, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.inner.lock().sleeps.clone()
    }

    /// Sum of all recorded sleeps.
    pub fn total_slept(&self) -> Duration {
        self.inner.lock().sleeps.iter().sum()
    }

    fn record_sleep(&self, duration: Duration) {
        let mut inner = self.inner.lock();
        inner.elapsed = inner.elapsed.saturating_add(duration);
        inner.sleeps.push(duration);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.inner.lock().elapsed
    }

    fn wall_clock(&self) -> DateTime<Utc> {
        let inner = self.inner.lock();
        let offset =
            chrono::Duration::from_std(inner.elapsed).unwrap_or_else(|_| chrono::Duration::zero());
        inner.wall_base + offset
    }
}

#[async_trait]
impl Sleeper for ManualClock {
    async fn sleep(&self, duration: Duration) {
        self.record_sleep(duration);
        // Let other tasks observe the new time before we resume.
        tokio::task::yield_now().await;
    }

    fn sleep_blocking(&self, duration: Duration) {
        self.record_sleep(duration);
    }

    fn sleep_blocking_cancellable(&self, duration: Duration, token: &CancellationToken) -> bool {
        if token.is_cancelled() {
            return false;
        }
        self.record_sleep(duration);
        true
    }
}

/// Shared system clock.
pub fn default_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock::new())
}

/// Shared tokio-backed sleeper.
pub fn default_sleeper() -> Arc<dyn Sleeper> {
    Arc::new(TokioSleeper)
}
