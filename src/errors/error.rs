//! Error types for the resilience layer.

use crate::errors::categories::{Classify, ErrorKind};
use crate::resilience::retry_after::{parse_retry_after, HeaderSource};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for operations wrapped by the resilience layer
pub type ResilienceResult<T, E> = Result<T, ResilienceError<E>>;

/// Result type alias for configuration construction
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Outcome of a failed resilient call.
///
/// `E` is the caller's own operation error. It is passed through unchanged for
/// non-retryable failures and kept as `last_error` on exhaustion so operators can
/// diagnose the final failure without re-running anything.
#[derive(Error, Debug)]
pub enum ResilienceError<E> {
    /// The operation failed and the failure was not retried further
    #[error(transparent)]
    Operation(E),

    /// Every permitted attempt failed
    #[error(
        "retry exhausted after {attempts} attempts{}: {last_error}",
        request_suffix(.request_id)
    )]
    RetryExhausted {
        /// Number of times the operation was invoked
        attempts: u32,
        /// The error returned by the final attempt
        #[source]
        last_error: E,
        /// Caller-supplied correlation id
        request_id: Option<String>,
        /// Wall time spent across all attempts and waits
        elapsed: Duration,
    },

    /// The circuit breaker rejected the call before the operation ran
    #[error("circuit breaker '{name}' is open")]
    CircuitOpen {
        /// Name of the breaker that rejected the call
        name: String,
        /// Time until the breaker lets a probe through
        retry_in: Option<Duration>,
    },

    /// A client-side rate limiter refused the call
    #[error(transparent)]
    RateLimited(#[from] RateLimitError),

    /// The call was cancelled while waiting
    #[error("operation cancelled after {attempts} attempts")]
    Cancelled {
        /// Attempts made before cancellation
        attempts: u32,
    },
}

fn request_suffix(request_id: &Option<String>) -> String {
    match request_id {
        Some(id) => format!(" (request {})", id),
        None => String::new(),
    }
}

impl<E> ResilienceError<E> {
    /// Returns true if every permitted attempt was used up.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, ResilienceError::RetryExhausted { .. })
    }

    /// Returns true if the circuit breaker rejected the call.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ResilienceError::CircuitOpen { .. })
    }

    /// Returns true if the call was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ResilienceError::Cancelled { .. })
    }

    /// Number of attempts made, when known.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            ResilienceError::RetryExhausted { attempts, .. }
            | ResilienceError::Cancelled { attempts } => Some(*attempts),
            _ => None,
        }
    }

    /// The underlying operation error, if one was produced.
    pub fn inner(&self) -> Option<&E> {
        match self {
            ResilienceError::Operation(e) => Some(e),
            ResilienceError::RetryExhausted { last_error, .. } => Some(last_error),
            _ => None,
        }
    }

    /// Consume the error and return the underlying operation error, if any.
    pub fn into_inner(self) -> Option<E> {
        match self {
            ResilienceError::Operation(e) => Some(e),
            ResilienceError::RetryExhausted { last_error, .. } => Some(last_error),
            _ => None,
        }
    }
}

impl<E: Classify> Classify for ResilienceError<E> {
    fn kind(&self) -> ErrorKind {
        match self {
            ResilienceError::Operation(e) => e.kind(),
            ResilienceError::RetryExhausted { last_error, .. } => last_error.kind(),
            ResilienceError::RateLimited(e) => ErrorKind::RateLimit {
                retry_after: e.wait(),
            },
            ResilienceError::CircuitOpen { .. } | ResilienceError::Cancelled { .. } => {
                ErrorKind::Unknown
            }
        }
    }
}

/// Rejection by a client-side rate limiter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RateLimitError {
    /// The limiter has no budget left and will not wait for it
    #[error("rate limit exceeded on '{limiter}', retry after {retry_after}s")]
    Exceeded {
        /// Name of the limiter that refused
        limiter: String,
        /// Exact time until the request could be admitted
        wait: Duration,
        /// `wait` rounded up to whole seconds
        retry_after: u64,
    },

    /// The request can never be admitted by this limiter
    #[error("request for {requested} permits exceeds capacity {capacity} of '{limiter}'")]
    ExceedsCapacity {
        /// Name of the limiter that refused
        limiter: String,
        /// Permits requested
        requested: u32,
        /// Limiter capacity
        capacity: f64,
    },
}

impl RateLimitError {
    /// Build an `Exceeded` error, rounding the wait up to whole seconds.
    pub fn exceeded(limiter: impl Into<String>, wait: Duration) -> Self {
        RateLimitError::Exceeded {
            limiter: limiter.into(),
            wait,
            retry_after: ceil_secs(wait),
        }
    }

    /// Name of the limiter that produced this error.
    pub fn limiter(&self) -> &str {
        match self {
            RateLimitError::Exceeded { limiter, .. }
            | RateLimitError::ExceedsCapacity { limiter, .. } => limiter,
        }
    }

    /// Time to wait before retrying, if admission is possible at all.
    pub fn wait(&self) -> Option<Duration> {
        match self {
            RateLimitError::Exceeded { wait, .. } => Some(*wait),
            RateLimitError::ExceedsCapacity { .. } => None,
        }
    }
}

fn ceil_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs();
    if wait.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs
    }
}

/// Invalid configuration, reported at construction time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A configuration value violates its constraints
    #[error("invalid {field}: {message}")]
    Invalid {
        /// Name of the offending field
        field: &'static str,
        /// Description of the violated constraint
        message: String,
    },

    /// An environment variable could not be parsed
    #[error("invalid environment variable {var}: {message}")]
    Environment {
        /// Variable name
        var: String,
        /// Parse failure description
        message: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            message: message.into(),
        }
    }
}

/// Concrete API failure implementing the classification contract.
///
/// Clients that do not have their own error taxonomy can map transport failures
/// and HTTP responses onto this type and hand it to the retry executor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// Connection failed or was dropped
    #[error("Connection error: {message}")]
    Connection {
        /// Error message describing the connection issue
        message: String,
    },

    /// Request timed out
    #[error("Timeout: {message}")]
    Timeout {
        /// Error message describing the timeout
        message: String,
    },

    /// Too many requests
    #[error("Rate limit error: {message}")]
    RateLimit {
        /// Error message describing the rate limit issue
        message: String,
        /// Duration to wait before retrying (if provided by the server)
        retry_after: Option<Duration>,
    },

    /// 5xx response
    #[error("Server error: {message}")]
    Server {
        /// Error message from the server
        message: String,
        /// HTTP status code
        status_code: Option<u16>,
        /// Whether the failure is transient
        retryable: bool,
    },

    /// 4xx response other than 408 and 429
    #[error("Client error: {message}")]
    Client {
        /// Error message describing the rejected request
        message: String,
        /// HTTP status code
        status_code: Option<u16>,
    },

    /// Unclassified failure
    #[error("Unknown error: {message}")]
    Unknown {
        /// Error message
        message: String,
    },
}

impl ApiError {
    /// Map an HTTP error status onto the taxonomy.
    ///
    /// 429 reads `Retry-After` from `headers`. 500, 502, 503, 504 and 529 are
    /// transient; other 5xx codes such as 501 are definitional and not retried.
    pub fn from_status<H>(status: u16, message: impl Into<String>, headers: &H) -> Self
    where
        H: HeaderSource + ?Sized,
    {
        let message = message.into();
        match status {
            408 => ApiError::Timeout { message },
            429 => ApiError::RateLimit {
                message,
                retry_after: parse_retry_after(headers),
            },
            400..=499 => ApiError::Client {
                message,
                status_code: Some(status),
            },
            500..=599 => ApiError::Server {
                message,
                status_code: Some(status),
                retryable: is_transient_server_status(status),
            },
            _ => ApiError::Unknown { message },
        }
    }

    /// Server error with retryability derived from the status code.
    pub fn server(message: impl Into<String>, status_code: u16) -> Self {
        ApiError::Server {
            message: message.into(),
            status_code: Some(status_code),
            retryable: is_transient_server_status(status_code),
        }
    }

    /// Returns true if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Returns the retry-after duration if available.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn is_transient_server_status(status: u16) -> bool {
    matches!(status, 500 | 502 | 503 | 504 | 529)
}

impl Classify for ApiError {
    fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Connection { .. } => ErrorKind::Connection,
            ApiError::Timeout { .. } => ErrorKind::Timeout,
            ApiError::RateLimit { retry_after, .. } => ErrorKind::RateLimit {
                retry_after: *retry_after,
            },
            ApiError::Server { retryable, .. } => ErrorKind::Server {
                is_retryable: *retryable,
            },
            ApiError::Client { .. } => ErrorKind::Client,
            ApiError::Unknown { .. } => ErrorKind::Unknown,
        }
    }
}
