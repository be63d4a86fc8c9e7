//! Error classification contract.
//!
//! The retry executor never inspects caller errors directly. Instead every
//! operation error implements [`Classify`], which maps it onto an [`ErrorKind`];
//! the kind alone decides whether a failure is retried and how long to wait.

use serde::Serialize;
use std::io;
use std::time::Duration;

/// Classification of an operation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The connection could not be established or was dropped
    Connection,
    /// The operation timed out
    Timeout,
    /// The remote side is throttling us
    RateLimit {
        /// Server-provided hint for how long to wait
        retry_after: Option<Duration>,
    },
    /// The remote side failed
    Server {
        /// Whether this particular server failure is transient
        is_retryable: bool,
    },
    /// The request itself was rejected
    Client,
    /// Anything else
    Unknown,
}

impl ErrorKind {
    /// Retry decision matrix.
    ///
    /// | kind       | retried                |
    /// |------------|------------------------|
    /// | Connection | yes                    |
    /// | Timeout    | yes                    |
    /// | RateLimit  | yes                    |
    /// | Server     | only if `is_retryable` |
    /// | Client     | no                     |
    /// | Unknown    | no                     |
    pub fn is_retryable(&self) -> bool {
        match self {
            ErrorKind::Connection | ErrorKind::Timeout | ErrorKind::RateLimit { .. } => true,
            ErrorKind::Server { is_retryable } => *is_retryable,
            ErrorKind::Client | ErrorKind::Unknown => false,
        }
    }

    /// The retry-after hint carried by rate-limit errors.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ErrorKind::RateLimit { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Whether this is a rate-limit failure.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ErrorKind::RateLimit { .. })
    }

    /// Broad category used for reporting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            ErrorKind::Connection | ErrorKind::Timeout => ErrorCategory::TransientNetwork,
            ErrorKind::RateLimit { .. } => ErrorCategory::RateLimited,
            ErrorKind::Server { .. } => ErrorCategory::ServerFault,
            ErrorKind::Client => ErrorCategory::ClientFault,
            ErrorKind::Unknown => ErrorCategory::Unknown,
        }
    }

    /// Short stable label, suitable for metric labels and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimit { .. } => "rate_limit",
            ErrorKind::Server { .. } => "server",
            ErrorKind::Client => "client",
            ErrorKind::Unknown => "unknown",
        }
    }
}

/// Failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Connection and timeout failures
    TransientNetwork,
    /// Throttling by the remote side
    RateLimited,
    /// Remote failures
    ServerFault,
    /// Malformed or rejected requests
    ClientFault,
    /// Unclassified failures
    Unknown,
}

/// Implemented by every error an operation may return.
pub trait Classify {
    /// Classify this error.
    fn kind(&self) -> ErrorKind;
}

impl Classify for ErrorKind {
    fn kind(&self) -> ErrorKind {
        *self
    }
}

impl<T: Classify + ?Sized> Classify for &T {
    fn kind(&self) -> ErrorKind {
        (**self).kind()
    }
}

impl<T: Classify + ?Sized> Classify for Box<T> {
    fn kind(&self) -> ErrorKind {
        (**self).kind()
    }
}

impl Classify for io::Error {
    fn kind(&self) -> ErrorKind {
        match io::Error::kind(self) {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ErrorKind::Timeout,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => ErrorKind::Connection,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => ErrorKind::Client,
            _ => ErrorKind::Unknown,
        }
    }
}
