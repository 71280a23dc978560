use std::time::Duration;

use bon::Builder;
use serde::{Deserialize, Serialize};

use crate::{
    adaptive_concurrency::{
        ConcurrencySettings,
        retries::{ExponentialBackoff, JitterMode},
    },
    error::ConfigError,
    rate_limit::RateSettings,
};

/// Configuration of a single evaluation run.
///
/// Every field has a default, so `ExecutorConfig::default()` is a usable starting point and
/// a partial JSON/TOML document deserializes into a complete config.
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `max_retries` | 3 | Counted attempts per task before it is marked `FAILED` |
/// | `initial_rate` / `min_rate` / `max_rate` | 10 / 0.5 / 100 | Token refill rate bounds, tasks per second |
/// | `rate_increase_step` | 1.0 | Additive increase after a success streak |
/// | `rate_decrease_factor` | 0.5 | Multiplicative decrease on a rate-limit signal |
/// | `rate_success_threshold` | 10 | Successes needed before the rate grows |
/// | `bucket_capacity` | 10 | Burst size of the token bucket |
/// | `tokens_per_task` | 1 | Tokens consumed by each attempt |
/// | `initial_concurrency` / `min_concurrency` / `max_concurrency` | 4 / 1 / 32 | In-flight bounds |
/// | `adaptive_concurrency` | true | Whether the in-flight bound adapts at all |
/// | `per_attempt_timeout_ms` | none | Upper bound for a single call of the unit of work |
/// | `fail_fast` | false | A fatal failure cancels every task that has not started |
///
/// # Example
///
/// ```rust
/// use eval_executor::ExecutorConfig;
///
/// let config = ExecutorConfig::builder()
///     .max_retries(5)
///     .initial_rate(20.0)
///     .max_concurrency(8)
///     .per_attempt_timeout_ms(30_000)
///     .build();
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Debug, PartialEq, Builder, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorConfig {
    /// Counted attempts allowed per task. A task whose every attempt fails transiently ends
    /// `FAILED` with exactly this many entries in `exceptions`.
    #[builder(default = default_max_retries())]
    pub(crate) max_retries: usize,

    #[builder(default = default_initial_rate())]
    pub(crate) initial_rate: f64,
    #[builder(default = default_min_rate())]
    pub(crate) min_rate: f64,
    #[builder(default = default_max_rate())]
    pub(crate) max_rate: f64,
    #[builder(default = default_rate_increase_step())]
    pub(crate) rate_increase_step: f64,
    /// **Range**: 0 < rate_decrease_factor < 1
    #[builder(default = default_decrease_factor())]
    pub(crate) rate_decrease_factor: f64,
    #[builder(default = default_success_threshold())]
    pub(crate) rate_success_threshold: usize,
    #[builder(default = default_bucket_capacity())]
    pub(crate) bucket_capacity: f64,
    /// Must not exceed `bucket_capacity`, otherwise no attempt could ever be admitted.
    #[builder(default = default_tokens_per_task())]
    pub(crate) tokens_per_task: f64,

    #[builder(default = default_initial_concurrency())]
    pub(crate) initial_concurrency: usize,
    #[builder(default = default_min_concurrency())]
    pub(crate) min_concurrency: usize,
    #[builder(default = default_max_concurrency())]
    pub(crate) max_concurrency: usize,
    #[builder(default = true)]
    pub(crate) adaptive_concurrency: bool,
    #[builder(default = default_success_threshold())]
    pub(crate) concurrency_success_threshold: usize,
    #[builder(default = default_decrease_factor())]
    pub(crate) concurrency_decrease_factor: f64,

    pub(crate) per_attempt_timeout_ms: Option<u64>,
    #[builder(default)]
    pub(crate) fail_fast: bool,

    /// When false (the default) rate-limited attempts are retried without spending the
    /// `max_retries` budget, up to `max_rate_limit_retries` times.
    #[builder(default)]
    pub(crate) count_rate_limits_as_attempts: bool,
    #[builder(default = default_max_rate_limit_retries())]
    pub(crate) max_rate_limit_retries: usize,

    /// Delay before retry `n` (1-based) is `backoff_base^n * backoff_factor_ms`, capped at
    /// `max_backoff_ms`, then jittered.
    #[builder(default = default_backoff_base())]
    pub(crate) backoff_base: u64,
    #[builder(default = default_backoff_factor_ms())]
    pub(crate) backoff_factor_ms: u64,
    #[builder(default = default_max_backoff_ms())]
    pub(crate) max_backoff_ms: u64,
    #[builder(default)]
    pub(crate) jitter: JitterMode,

    /// Size of the worker pool. Defaults to `max_concurrency`.
    pub(crate) workers: Option<usize>,
}

const fn default_max_retries() -> usize {
    3
}

const fn default_initial_rate() -> f64 {
    10.0
}

const fn default_min_rate() -> f64 {
    0.5
}

const fn default_max_rate() -> f64 {
    100.0
}

const fn default_rate_increase_step() -> f64 {
    1.0
}

/// Halve on every capacity signal, mirroring TCP congestion control.
const fn default_decrease_factor() -> f64 {
    0.5
}

const fn default_success_threshold() -> usize {
    10
}

const fn default_bucket_capacity() -> f64 {
    10.0
}

const fn default_tokens_per_task() -> f64 {
    1.0
}

const fn default_initial_concurrency() -> usize {
    4
}

const fn default_min_concurrency() -> usize {
    1
}

const fn default_max_concurrency() -> usize {
    32
}

const fn default_max_rate_limit_retries() -> usize {
    32
}

const fn default_backoff_base() -> u64 {
    2
}

const fn default_backoff_factor_ms() -> u64 {
    50
}

const fn default_max_backoff_ms() -> u64 {
    10_000
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_rate: default_initial_rate(),
            min_rate: default_min_rate(),
            max_rate: default_max_rate(),
            rate_increase_step: default_rate_increase_step(),
            rate_decrease_factor: default_decrease_factor(),
            rate_success_threshold: default_success_threshold(),
            bucket_capacity: default_bucket_capacity(),
            tokens_per_task: default_tokens_per_task(),
            initial_concurrency: default_initial_concurrency(),
            min_concurrency: default_min_concurrency(),
            max_concurrency: default_max_concurrency(),
            adaptive_concurrency: true,
            concurrency_success_threshold: default_success_threshold(),
            concurrency_decrease_factor: default_decrease_factor(),
            per_attempt_timeout_ms: None,
            fail_fast: false,
            count_rate_limits_as_attempts: false,
            max_rate_limit_retries: default_max_rate_limit_retries(),
            backoff_base: default_backoff_base(),
            backoff_factor_ms: default_backoff_factor_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter: JitterMode::default(),
            workers: None,
        }
    }
}

fn check_range(
    name: &'static str,
    value: f64,
    range: &'static str,
    ok: impl Fn(f64) -> bool,
) -> Result<(), ConfigError> {
    if value.is_finite() && ok(value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange { name, range, value })
    }
}

impl ExecutorConfig {
    /// Checks every bound. Called once at the start of each run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::ZeroMaxRetries);
        }

        let rates_ok = [self.min_rate, self.initial_rate, self.max_rate]
            .iter()
            .all(|rate| rate.is_finite())
            && self.min_rate > 0.0
            && self.min_rate <= self.initial_rate
            && self.initial_rate <= self.max_rate;
        if !rates_ok {
            return Err(ConfigError::InvalidRateBounds {
                min_rate: self.min_rate,
                initial_rate: self.initial_rate,
                max_rate: self.max_rate,
            });
        }

        if self.min_concurrency == 0
            || self.min_concurrency > self.initial_concurrency
            || self.initial_concurrency > self.max_concurrency
        {
            return Err(ConfigError::InvalidConcurrencyBounds {
                min: self.min_concurrency,
                initial: self.initial_concurrency,
                max: self.max_concurrency,
            });
        }

        check_range("rate_increase_step", self.rate_increase_step, "(0, inf)", |v| v > 0.0)?;
        check_range("rate_decrease_factor", self.rate_decrease_factor, "(0, 1)", |v| {
            v > 0.0 && v < 1.0
        })?;
        check_range(
            "concurrency_decrease_factor",
            self.concurrency_decrease_factor,
            "(0, 1)",
            |v| v > 0.0 && v < 1.0,
        )?;
        check_range(
            "rate_success_threshold",
            self.rate_success_threshold as f64,
            "[1, inf)",
            |v| v >= 1.0,
        )?;
        check_range(
            "concurrency_success_threshold",
            self.concurrency_success_threshold as f64,
            "[1, inf)",
            |v| v >= 1.0,
        )?;
        check_range("bucket_capacity", self.bucket_capacity, "(0, inf)", |v| v > 0.0)?;
        check_range("backoff_base", self.backoff_base as f64, "[1, inf)", |v| v >= 1.0)?;
        if let Some(workers) = self.workers {
            check_range("workers", workers as f64, "[1, inf)", |v| v >= 1.0)?;
        }

        self.rate_settings().check_cost(self.tokens_per_task)?;
        Ok(())
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    pub fn fail_fast(&self) -> bool {
        self.fail_fast
    }

    pub fn per_attempt_timeout(&self) -> Option<Duration> {
        self.per_attempt_timeout_ms.map(Duration::from_millis)
    }

    pub(crate) fn rate_settings(&self) -> RateSettings {
        RateSettings {
            capacity: self.bucket_capacity,
            initial_rate: self.initial_rate,
            min_rate: self.min_rate,
            max_rate: self.max_rate,
            increase_step: self.rate_increase_step,
            decrease_factor: self.rate_decrease_factor,
            success_threshold: self.rate_success_threshold,
        }
    }

    pub(crate) fn concurrency_settings(&self) -> ConcurrencySettings {
        ConcurrencySettings {
            initial_concurrency: self.initial_concurrency,
            min_concurrency: self.min_concurrency,
            max_concurrency: self.max_concurrency,
            adaptive: self.adaptive_concurrency,
            success_threshold: self.concurrency_success_threshold,
            decrease_ratio: self.concurrency_decrease_factor,
        }
    }

    /// A fresh backoff schedule for one task.
    pub(crate) fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::from_millis(self.backoff_base)
            .factor(self.backoff_factor_ms)
            .max_delay(Duration::from_millis(self.max_backoff_ms))
    }

    /// Number of pool workers for a run over `tasks` inputs; never zero, never more than
    /// there are tasks to pull.
    pub(crate) fn worker_count(&self, tasks: usize) -> usize {
        self.workers
            .unwrap_or(self.max_concurrency)
            .min(tasks)
            .max(1)
    }
}
