//! Error types for the resilience layer.
//!
//! This module provides the error classification contract and the error taxonomy
//! returned by retry execution, circuit breaking and rate limiting.

mod categories;
mod error;

pub use categories::{Classify, ErrorCategory, ErrorKind};
pub use error::{
    ApiError, ConfigError, ConfigResult, RateLimitError, ResilienceError, ResilienceResult,
};
