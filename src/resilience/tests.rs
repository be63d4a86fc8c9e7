//! Tests for the resilience components working together

use super::*;
use crate::clock::ManualClock;
use crate::config::ResilienceConfig;
use crate::errors::{ApiError, RateLimitError, ResilienceError};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn no_jitter(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_secs(1),
        multiplier: 2.0,
        jitter: 0.0,
    }
}

fn orchestrator(config: ResilienceConfig, clock: &Arc<ManualClock>) -> ResilienceOrchestrator {
    ResilienceOrchestrator::builder()
        .config(config)
        .clock(clock.clone())
        .sleeper(clock.clone())
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_full_resilience_stack_success() {
    let clock = Arc::new(ManualClock::new());
    let config = ResilienceConfig {
        retry: no_jitter(3),
        circuit_breaker: CircuitBreakerConfig::new(5, Duration::from_secs(30)),
        rate_limit: Some(TokenBucketConfig::per_second(10)),
        ..Default::default()
    };
    let orchestrator = orchestrator(config, &clock);

    let result = orchestrator
        .execute(|| async { Ok::<_, ApiError>("success") })
        .await;

    assert_eq!(result.unwrap(), "success");
    assert_eq!(orchestrator.circuit_breaker().stats().total_successes, 1);
    assert_eq!(orchestrator.rate_limiter().unwrap().stats().acquired, 1);
}

#[tokio::test]
async fn test_retry_respects_max_retries() {
    let clock = Arc::new(ManualClock::new());
    let orchestrator = orchestrator(
        ResilienceConfig {
            retry: no_jitter(3),
            circuit_breaker: CircuitBreakerConfig::new(100, Duration::from_secs(30)),
            ..Default::default()
        },
        &clock,
    );
    let attempts = AtomicU32::new(0);

    let result = orchestrator
        .execute_with(
            ExecuteOptions::new()
                .request_id("req_123")
                .signal_exhaustion(true),
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(ApiError::Connection {
                        message: "Connection reset".to_string(),
                    })
                }
            },
        )
        .await;

    match result {
        Err(ResilienceError::RetryExhausted {
            attempts: made,
            request_id,
            ..
        }) => {
            assert_eq!(made, 3);
            assert_eq!(request_id.as_deref(), Some("req_123"));
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(
        clock.sleeps(),
        vec![Duration::from_millis(10), Duration::from_millis(20)]
    );
}

#[tokio::test]
async fn test_non_retryable_error_fails_immediately() {
    let clock = Arc::new(ManualClock::new());
    let orchestrator = orchestrator(
        ResilienceConfig {
            retry: no_jitter(5),
            circuit_breaker: CircuitBreakerConfig::new(1, Duration::from_secs(30)),
            ..Default::default()
        },
        &clock,
    );
    let attempts = AtomicU32::new(0);

    let result = orchestrator
        .execute(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<(), _>(ApiError::Client {
                    message: "Invalid request".to_string(),
                    status_code: Some(400),
                })
            }
        })
        .await;

    assert!(matches!(
        result,
        Err(ResilienceError::Operation(ApiError::Client { .. }))
    ));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    // Client faults leave the breaker closed even with a threshold of one.
    assert_eq!(orchestrator.circuit_breaker().state(), CircuitState::Closed);
    assert!(clock.sleeps().is_empty());
}

#[tokio::test]
async fn test_circuit_breaker_half_open_recovery() {
    let clock = Arc::new(ManualClock::new());
    let orchestrator = orchestrator(
        ResilienceConfig {
            retry: no_jitter(1),
            circuit_breaker: CircuitBreakerConfig::new(3, Duration::from_secs(30)),
            ..Default::default()
        },
        &clock,
    );

    for _ in 0..3 {
        let _ = orchestrator
            .execute(|| async { Err::<(), _>(ApiError::server("Bad gateway", 502)) })
            .await;
    }
    assert_eq!(orchestrator.circuit_breaker().state(), CircuitState::Open);

    clock.advance(Duration::from_secs(10));
    match orchestrator.execute(|| async { Ok::<_, ApiError>(()) }).await {
        Err(ResilienceError::CircuitOpen { retry_in, .. }) => {
            assert_eq!(retry_in, Some(Duration::from_secs(20)));
        }
        other => panic!("expected open circuit, got {other:?}"),
    }

    clock.advance(Duration::from_secs(20));
    assert_eq!(orchestrator.circuit_breaker().state(), CircuitState::HalfOpen);

    // A failed probe reopens immediately.
    let _ = orchestrator
        .execute(|| async { Err::<(), _>(ApiError::server("Bad gateway", 502)) })
        .await;
    assert_eq!(orchestrator.circuit_breaker().state(), CircuitState::Open);

    clock.advance(Duration::from_secs(30));
    let result = orchestrator.execute(|| async { Ok::<_, ApiError>(1) }).await;
    assert_eq!(result.unwrap(), 1);
    assert_eq!(orchestrator.circuit_breaker().state(), CircuitState::Closed);
    assert_eq!(orchestrator.circuit_breaker().stats().times_opened, 2);
}

#[tokio::test]
async fn test_consecutive_rate_limits_escalate_per_endpoint() {
    let clock = Arc::new(ManualClock::new());
    let orchestrator = orchestrator(
        ResilienceConfig {
            retry: no_jitter(4),
            ..Default::default()
        },
        &clock,
    );
    let attempts = AtomicU32::new(0);

    let result = orchestrator
        .execute_with(ExecuteOptions::new().endpoint("chat.postMessage"), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Err(ApiError::from_status(
                        429,
                        "Too many requests",
                        &[("Retry-After", "2")][..],
                    ))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), 3);
    assert_eq!(
        clock.sleeps(),
        vec![
            Duration::from_secs(2),
            Duration::from_secs(4),
            Duration::from_secs(6)
        ]
    );
    let state = orchestrator.retry_after().state("chat.postMessage");
    assert_eq!(state.consecutive_429s, 0);
    assert!(!state.is_limited);
}

#[tokio::test]
async fn test_retry_after_is_capped() {
    let clock = Arc::new(ManualClock::new());
    let orchestrator = orchestrator(
        ResilienceConfig {
            retry: no_jitter(2),
            retry_after: RetryAfterConfig::default().with_max_retry_after(Duration::from_secs(90)),
            ..Default::default()
        },
        &clock,
    );

    let result = orchestrator
        .execute(|| async {
            Err::<(), _>(ApiError::RateLimit {
                message: "slow down".to_string(),
                retry_after: Some(Duration::from_secs(600)),
            })
        })
        .await;

    assert!(result.is_err());
    assert_eq!(clock.sleeps(), vec![Duration::from_secs(90)]);
}

#[tokio::test]
async fn test_rate_limiter_waits_between_attempts() {
    let clock = Arc::new(ManualClock::new());
    let orchestrator = orchestrator(
        ResilienceConfig {
            retry: RetryConfig {
                base_delay: Duration::from_millis(250),
                ..no_jitter(3)
            },
            rate_limit: Some(TokenBucketConfig::new(1.0, 2.0)),
            ..Default::default()
        },
        &clock,
    );
    let attempts = AtomicU32::new(0);

    let result = orchestrator
        .execute(|| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(ApiError::Timeout {
                        message: "read timed out".to_string(),
                    })
                } else {
                    Ok(())
                }
            }
        })
        .await;

    assert!(result.is_ok());
    // The backoff refills half a token; the bucket waits for the other half.
    assert_eq!(
        clock.sleeps(),
        vec![Duration::from_millis(250), Duration::from_millis(250)]
    );
}

#[tokio::test]
async fn test_composite_limiter_in_executor() {
    let clock = Arc::new(ManualClock::new());
    let per_second = Arc::new(
        TokenBucket::named("per_second", TokenBucketConfig::new(2.0, 2.0))
            .unwrap()
            .with_clock(clock.clone())
            .with_sleeper(clock.clone()),
    );
    let per_minute = Arc::new(
        SlidingWindow::named("per_minute", SlidingWindowConfig::new(3, Duration::from_secs(60)))
            .unwrap()
            .with_clock(clock.clone()),
    );
    let composite = Arc::new(
        CompositeRateLimiter::named("api")
            .with_limiter("per_second", per_second.clone())
            .with_limiter("per_minute", per_minute.clone())
            .with_sleeper(clock.clone()),
    );
    let executor = RetryExecutor::new(no_jitter(1))
        .unwrap()
        .with_clock(clock.clone())
        .with_sleeper(clock.clone())
        .with_rate_limiter(composite);

    for _ in 0..3 {
        executor
            .execute(|| async { Ok::<_, ApiError>(()) })
            .await
            .unwrap();
    }
    assert_eq!(clock.sleeps(), vec![Duration::from_millis(500)]);

    let result = executor.execute(|| async { Ok::<_, ApiError>(()) }).await;
    match result {
        Err(ResilienceError::RateLimited(error)) => {
            assert_eq!(error.limiter(), "per_minute");
        }
        other => panic!("expected rate limit, got {other:?}"),
    }
    assert_eq!(per_minute.request_count(), 3);
    assert_eq!(per_second.stats().acquired, 3);
}

#[tokio::test]
async fn test_adaptive_limiter_follows_outcomes() {
    let clock = Arc::new(ManualClock::new());
    let adaptive = Arc::new(
        AdaptiveRateLimiter::new(AdaptiveConfig {
            initial_rate: 8.0,
            success_threshold: 2,
            ..Default::default()
        })
        .unwrap()
        .with_clock(clock.clone())
        .with_sleeper(clock.clone()),
    );
    let executor = RetryExecutor::new(no_jitter(2))
        .unwrap()
        .with_clock(clock.clone())
        .with_sleeper(clock.clone())
        .with_adaptive_limiter(adaptive.clone());

    let attempts = AtomicU32::new(0);
    executor
        .execute(|| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(ApiError::RateLimit {
                        message: "slow down".to_string(),
                        retry_after: Some(Duration::from_secs(1)),
                    })
                } else {
                    Ok(())
                }
            }
        })
        .await
        .unwrap();
    assert_eq!(adaptive.current_rate(), 4.0);

    executor
        .execute(|| async { Ok::<_, ApiError>(()) })
        .await
        .unwrap();
    assert!((adaptive.current_rate() - 4.4).abs() < 1e-9);
}

#[tokio::test]
async fn test_cancellation_during_backoff() {
    let clock = Arc::new(ManualClock::new());
    let orchestrator = orchestrator(
        ResilienceConfig {
            retry: no_jitter(5),
            ..Default::default()
        },
        &clock,
    );
    let token = CancellationToken::new();
    let cancel = token.clone();
    let attempts = AtomicU32::new(0);

    let result = orchestrator
        .execute_with(
            ExecuteOptions::new()
                .cancellation(token)
                .on_retry(move |_: &ApiError, _, _| cancel.cancel()),
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ApiError::server("unavailable", 503)) }
            },
        )
        .await;

    assert!(matches!(
        result,
        Err(ResilienceError::Cancelled { attempts: 1 })
    ));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_endpoint_limiters_fed_from_headers() {
    let clock = Arc::new(ManualClock::new());
    let limiters = EndpointRateLimiters::new(TokenBucketConfig::new(5.0, 1.0))
        .unwrap()
        .with_clock(clock.clone())
        .with_sleeper(clock.clone());

    let mut headers = http::HeaderMap::new();
    headers.insert("x-ratelimit-limit", "5".parse().unwrap());
    headers.insert("x-ratelimit-remaining", "1".parse().unwrap());
    let parsed = RateLimitHeaders::from_headers(&headers);

    limiters.update_from_headers("files.upload", &parsed);
    assert!(limiters.try_acquire("files.upload", 1));
    assert!(!limiters.try_acquire("files.upload", 1));
    assert!(limiters.try_acquire("users.info", 5));

    limiters.acquire("files.upload", 1).await.unwrap();
    assert_eq!(clock.sleeps(), vec![Duration::from_secs(1)]);
}

#[tokio::test]
async fn test_oversized_request_is_rejected_by_stack() {
    let clock = Arc::new(ManualClock::new());
    let bucket = Arc::new(
        TokenBucket::new(TokenBucketConfig::new(2.0, 1.0))
            .unwrap()
            .with_clock(clock.clone())
            .with_sleeper(clock.clone()),
    );

    let error = bucket.acquire(3).await.unwrap_err();
    assert!(matches!(error, RateLimitError::ExceedsCapacity { .. }));
    assert!(clock.sleeps().is_empty());
    assert_eq!(bucket.available(), 2.0);
}

#[test]
fn test_backoff_calculation() {
    let config = RetryConfig {
        max_retries: 5,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
        multiplier: 2.0,
        jitter: 0.0,
    };

    let delays: Vec<Duration> = (0..5).map(|attempt| calculate_delay(attempt, &config)).collect();
    assert_eq!(
        delays,
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(400),
            Duration::from_millis(800),
            Duration::from_secs(1),
        ]
    );
    assert_eq!(estimate_total_wait(5, &config), Duration::from_millis(2500));
}

#[tokio::test]
async fn test_passthrough_orchestrator() {
    let orchestrator = ResilienceOrchestrator::passthrough();

    let result = orchestrator.execute(|| async { Ok::<_, ApiError>(42) }).await;

    assert_eq!(result.unwrap(), 42);
}
