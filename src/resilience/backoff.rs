//! Exponential backoff with optional jitter.

use super::retry::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Compute the delay before retry number `attempt` (0-indexed).
///
/// `delay = base_delay * multiplier^attempt`, capped at `max_delay`. With a
/// non-zero jitter fraction `j` the result is sampled uniformly from
/// `[delay * (1 - j), delay * (1 + j)]` and capped again.
pub fn calculate_delay(attempt: u32, config: &RetryConfig) -> Duration {
    calculate_delay_with_rng(attempt, config, &mut rand::thread_rng())
}

/// [`calculate_delay`] with a caller-supplied random source.
pub fn calculate_delay_with_rng<R>(attempt: u32, config: &RetryConfig, rng: &mut R) -> Duration
where
    R: Rng + ?Sized,
{
    let capped = capped_nanos(attempt, config);
    if config.jitter <= 0.0 {
        return Duration::from_nanos(capped as u64);
    }

    let max = config.max_delay.as_nanos() as f64;
    let low = capped * (1.0 - config.jitter);
    let high = capped * (1.0 + config.jitter);
    let sampled = rng.gen_range(low..=high).min(max).max(0.0);
    Duration::from_nanos(sampled.round() as u64)
}

/// Sum of the unjittered delays for the next `retries` retries.
pub fn estimate_total_wait(retries: u32, config: &RetryConfig) -> Duration {
    (0..retries)
        .map(|attempt| Duration::from_nanos(capped_nanos(attempt, config) as u64))
        .fold(Duration::ZERO, Duration::saturating_add)
}

fn capped_nanos(attempt: u32, config: &RetryConfig) -> f64 {
    let base = config.base_delay.as_nanos() as f64;
    let max = config.max_delay.as_nanos() as f64;
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let raw = base * config.multiplier.powi(exponent);

    if raw.is_finite() {
        raw.min(max)
    } else {
        max
    }
}
