use std::{fmt, time::Duration};

use snafu::Snafu;

/// Problems with the run configuration. These abort a run before any task starts.
#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display(
        "invalid rate bounds: need 0 < min_rate ({min_rate}) <= initial_rate ({initial_rate}) <= max_rate ({max_rate})"
    ))]
    InvalidRateBounds {
        min_rate: f64,
        initial_rate: f64,
        max_rate: f64,
    },

    #[snafu(display(
        "invalid concurrency bounds: need 1 <= min_concurrency ({min}) <= initial_concurrency ({initial}) <= max_concurrency ({max})"
    ))]
    InvalidConcurrencyBounds {
        min: usize,
        initial: usize,
        max: usize,
    },

    #[snafu(display("`{name}` must be within {range}, got {value}"))]
    OutOfRange {
        name: &'static str,
        range: &'static str,
        value: f64,
    },

    #[snafu(display("`max_retries` must allow at least one attempt"))]
    ZeroMaxRetries,

    #[snafu(display("token cost must be positive and finite, got {requested}"))]
    InvalidTokenCost { requested: f64 },

    #[snafu(display(
        "cannot acquire {requested} tokens from a bucket holding at most {capacity}"
    ))]
    AcquireExceedsCapacity { requested: f64, capacity: f64 },
}

/// Errors that abort a whole run. Per-task failures never surface here; they are
/// recorded in the task's [`ExecutionDetails`](crate::execution::ExecutionDetails).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ExecutorError {
    #[snafu(display("invalid executor configuration: {source}"))]
    Config { source: ConfigError },

    #[snafu(display("failed to build runtime for worker {worker}: {source}"))]
    RuntimeBuild {
        worker: usize,
        source: std::io::Error,
    },

    #[snafu(display(
        "`run_blocking` was called from a thread that is already driving a tokio runtime; await `run` instead"
    ))]
    BlockingInsideScheduler,
}

impl From<ConfigError> for ExecutorError {
    fn from(source: ConfigError) -> Self {
        ExecutorError::Config { source }
    }
}

/// One failed attempt, as captured in `ExecutionDetails::exceptions`.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptError<E> {
    /// The unit of work returned an error.
    Failed(E),
    /// The attempt exceeded the per-attempt timeout and was dropped.
    TimedOut { after: Duration },
}

impl<E> AttemptError<E> {
    pub fn as_failure(&self) -> Option<&E> {
        match self {
            AttemptError::Failed(error) => Some(error),
            AttemptError::TimedOut { .. } => None,
        }
    }

    pub const fn is_timeout(&self) -> bool {
        matches!(self, AttemptError::TimedOut { .. })
    }
}

impl<E: fmt::Display> fmt::Display for AttemptError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Failed(error) => write!(f, "{}", error),
            AttemptError::TimedOut { after } => {
                write!(f, "attempt timed out after {}ms", after.as_millis())
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for AttemptError<E> {}
