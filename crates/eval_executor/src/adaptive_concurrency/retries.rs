use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How a failed unit of work should be treated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The provider asked us to slow down. Always recoverable; feeds back into both
    /// controllers.
    RateLimited,
    /// Recoverable, but spends the task's retry budget.
    Transient,
    /// Never retried.
    Fatal,
}

impl FailureKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Transient => "transient",
            FailureKind::Fatal => "fatal",
        }
    }
}

/// Defines the contract for classifying errors produced by the unit of work.
///
/// The engine has no knowledge of any provider's error types; the caller decides which
/// errors mean "rate limited", which are worth retrying and which are fatal.
///
/// Any `Fn(&E) -> FailureKind` closure is a `RetryLogic<E>`.
///
/// # Example
/// ```rust
/// use eval_executor::adaptive_concurrency::retries::{FailureKind, RetryLogic};
///
/// #[derive(Debug)]
/// struct ApiError {
///     status: u16,
/// }
///
/// struct StatusLogic;
///
/// impl RetryLogic<ApiError> for StatusLogic {
///     fn classify(&self, error: &ApiError) -> FailureKind {
///         match error.status {
///             429 => FailureKind::RateLimited,
///             500..=599 => FailureKind::Transient,
///             _ => FailureKind::Fatal,
///         }
///     }
/// }
///
/// assert_eq!(StatusLogic.classify(&ApiError { status: 429 }), FailureKind::RateLimited);
/// assert!(!StatusLogic.is_retriable_error(&ApiError { status: 404 }));
/// ```
pub trait RetryLogic<E>: Send + Sync {
    fn classify(&self, error: &E) -> FailureKind;

    /// Determines if an error should trigger another attempt at all.
    fn is_retriable_error(&self, error: &E) -> bool {
        !matches!(self.classify(error), FailureKind::Fatal)
    }
}

impl<E, F> RetryLogic<E> for F
where
    F: Fn(&E) -> FailureKind + Send + Sync,
{
    fn classify(&self, error: &E) -> FailureKind {
        self(error)
    }
}

/// The classified result of a single attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<O, E> {
    Success(O),
    RateLimited(E),
    TransientFailure(E),
    FatalFailure(E),
}

impl<O, E> Outcome<O, E> {
    pub fn classify<L>(result: Result<O, E>, logic: &L) -> Self
    where
        L: RetryLogic<E> + ?Sized,
    {
        match result {
            Ok(output) => Outcome::Success(output),
            Err(error) => match logic.classify(&error) {
                FailureKind::RateLimited => Outcome::RateLimited(error),
                FailureKind::Transient => Outcome::TransientFailure(error),
                FailureKind::Fatal => Outcome::FatalFailure(error),
            },
        }
    }

    pub fn map_err<F, E2>(self, f: F) -> Outcome<O, E2>
    where
        F: FnOnce(E) -> E2,
    {
        match self {
            Outcome::Success(output) => Outcome::Success(output),
            Outcome::RateLimited(error) => Outcome::RateLimited(f(error)),
            Outcome::TransientFailure(error) => Outcome::TransientFailure(f(error)),
            Outcome::FatalFailure(error) => Outcome::FatalFailure(f(error)),
        }
    }

    pub const fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub const fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Outcome::Success(_) => None,
            Outcome::RateLimited(_) => Some(FailureKind::RateLimited),
            Outcome::TransientFailure(_) => Some(FailureKind::Transient),
            Outcome::FatalFailure(_) => Some(FailureKind::Fatal),
        }
    }
}

/// The jitter mode to use for retry backoff behavior.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterMode {
    /// No jitter.
    None,

    /// Full jitter.
    ///
    /// The random delay is anywhere from 0 up to the maximum current delay calculated by the backoff
    /// strategy.
    ///
    /// Incorporating full jitter into your backoff strategy can greatly reduce the likelihood
    /// of creating accidental denial of service (DoS) conditions against your own systems when
    /// many clients are recovering from a failure state.
    #[default]
    Full,
}

impl JitterMode {
    pub fn apply(&self, base_duration: Duration) -> Duration {
        match self {
            JitterMode::None => base_duration,
            JitterMode::Full => {
                if base_duration.as_millis() == 0 {
                    return Duration::from_millis(0);
                }
                let random_millis =
                    (rand::random::<f64>() * base_duration.as_millis() as f64) as u64;
                Duration::from_millis(random_millis)
            }
        }
    }
}

// `tokio-retry` crate
// MIT License
// Copyright (c) 2017 Sam Rijs
//
/// A retry strategy driven by exponential back-off.
///
/// The power corresponds to the number of past attempts.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    current: u64,
    base: u64,
    factor: u64,
    max_delay: Option<Duration>,
}

impl ExponentialBackoff {
    /// Constructs a new exponential back-off strategy,
    /// given a base duration in milliseconds.
    ///
    /// The resulting duration is calculated by taking the base to the `n`-th power,
    /// where `n` denotes the number of past attempts.
    pub const fn from_millis(base: u64) -> ExponentialBackoff {
        ExponentialBackoff {
            current: base,
            base,
            factor: 1u64,
            max_delay: None,
        }
    }

    /// A multiplicative factor that will be applied to the retry delay.
    ///
    /// For example, using a factor of `1000` will make each delay in units of seconds.
    pub const fn factor(mut self, factor: u64) -> ExponentialBackoff {
        self.factor = factor;
        self
    }

    /// Apply a maximum delay. No retry delay will be longer than this `Duration`.
    pub const fn max_delay(mut self, duration: Duration) -> ExponentialBackoff {
        self.max_delay = Some(duration);
        self
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }

    /// The delay before the next retry. The schedule never runs out.
    pub fn next_delay(&mut self) -> Duration {
        let duration = match self.current.checked_mul(self.factor) {
            Some(millis) => Duration::from_millis(millis),
            None => Duration::from_millis(u64::MAX),
        };

        if let Some(max_delay) = self.max_delay {
            if duration > max_delay {
                return max_delay;
            }
        }

        self.current = self.current.checked_mul(self.base).unwrap_or(u64::MAX);

        duration
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Some(self.next_delay())
    }
}
