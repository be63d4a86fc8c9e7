//! Logging and metrics for the resilience layer.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use integrations_resilience::observability::{
//!     InMemoryMetricsCollector, LogFormat, LogLevel, LoggingConfig, MetricsRetryHook,
//! };
//! use integrations_resilience::{RetryConfig, RetryExecutor};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! LoggingConfig::new()
//!     .with_level(LogLevel::Info)
//!     .with_format(LogFormat::Json)
//!     .init()?;
//!
//! let metrics = Arc::new(InMemoryMetricsCollector::new());
//! let executor = RetryExecutor::new(RetryConfig::default())?
//!     .with_hook(Arc::new(MetricsRetryHook::new(metrics.clone())));
//! # let _ = executor;
//! # Ok(())
//! # }
//! ```

mod logging;
mod metrics;

pub use logging::*;
pub use metrics::*;
