//! Concurrent evaluation engine with adaptive rate limiting and concurrency control.
//!
//! Runs one unit of work (typically a call to a rate-limited LLM provider) for every item
//! of an ordered input collection, and returns one result per input in input order,
//! whatever order the calls finish in.
//!
//! # Algorithm Overview
//!
//! Two independent controllers gate every attempt, both AIMD (Additive Increase
//! Multiplicative Decrease), as in TCP congestion control:
//! 1. **Concurrency**: a semaphore bounds in-flight calls. A success streak adds one slot;
//!    a rate limit or timeout multiplies the bound by a factor (default: 0.5).
//! 2. **Rate**: a token bucket paces call starts. A success streak adds
//!    `rate_increase_step` to the refill rate; a rate limit multiplies it by
//!    `rate_decrease_factor` (default: 0.5), effective immediately.
//!
//! Failures are classified by a caller-supplied [`RetryLogic`]: rate-limited attempts are
//! retried without spending the retry budget, transient failures are retried with
//! jittered exponential backoff up to `max_retries` attempts, fatal failures end the task
//! (and, with `fail_fast`, every task that has not started yet).
//!
//! # Scheduling
//! Inside a tokio runtime every task is multiplexed on the caller's task; without one, a
//! fixed pool of worker threads pulls from a shared queue. See [`executor`].
//!
//! # Basic Usage
//! ```
//! use eval_executor::{EvalExecutor, ExecutorConfig, FailureKind};
//!
//! #[derive(Debug)]
//! enum ApiError {
//!     TooManyRequests,
//!     BadRequest,
//! }
//!
//! let executor = EvalExecutor::new(
//!     |n: u64| async move {
//!         if n == 0 { Err(ApiError::BadRequest) } else { Ok(n * n) }
//!     },
//!     |error: &ApiError| match error {
//!         ApiError::TooManyRequests => FailureKind::RateLimited,
//!         ApiError::BadRequest => FailureKind::Fatal,
//!     },
//!     ExecutorConfig::builder().initial_rate(100.0).max_concurrency(4).build(),
//! );
//!
//! let report = executor.run_blocking(vec![3u64, 0, 4]).unwrap();
//! assert_eq!(report.summary().completed, 2);
//! let results = report.into_results();
//! assert_eq!(results[0].as_ref().ok(), Some(&9));
//! assert!(results[1].is_err());
//! assert_eq!(results[2].as_ref().ok(), Some(&16));
//! ```
//!
//! # Configuration
//! See [`ExecutorConfig`] for tuning parameters.
//!
//! # Metrics
//! Emits metrics through the `metrics` facade, see
//! [`adaptive_concurrency::internal_event`].

pub mod adaptive_concurrency;
pub mod config;
pub mod error;
pub mod execution;
pub mod executor;
pub mod rate_limit;
pub mod work;
#[cfg(test)]
pub mod test_utils;

#[macro_use]
extern crate tracing;

pub use adaptive_concurrency::retries::{FailureKind, Outcome, RetryLogic};
pub use config::ExecutorConfig;
pub use error::{AttemptError, ConfigError, ExecutorError};
pub use execution::{
    CancelHandle, ExecutionDetails, ExecutionStatus, ProgressObserver, RunReport, RunSummary,
    TaskEvent,
};
pub use executor::{EvalExecutor, ExecutorStrategy, StrategyKind, select_executor};
pub use work::{ServiceWork, Work};
