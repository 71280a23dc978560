//! Token-bucket rate limiting with an adaptive (AIMD) refill rate.
//!
//! Additive increase: every `success_threshold` consecutive successes the refill rate
//! grows by `increase_step`, up to `max_rate`.
//! Multiplicative decrease: every rate-limit signal multiplies the rate by
//! `decrease_factor`, down to `min_rate`, and resets the streak.

mod adaptive;
mod token_bucket;

pub use adaptive::{AdaptiveRateController, RateStats, TokenCost};
pub use token_bucket::TokenBucket;

use crate::error::ConfigError;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateSettings {
    /// Maximum tokens the bucket holds; also the largest burst.
    pub capacity: f64,
    pub initial_rate: f64,
    pub min_rate: f64,
    pub max_rate: f64,
    pub increase_step: f64,
    pub decrease_factor: f64,
    pub success_threshold: usize,
}

impl RateSettings {
    pub(crate) fn check_cost(&self, requested: f64) -> Result<(), ConfigError> {
        if !requested.is_finite() || requested <= 0.0 {
            return Err(ConfigError::InvalidTokenCost { requested });
        }
        if requested > self.capacity {
            return Err(ConfigError::AcquireExceedsCapacity {
                requested,
                capacity: self.capacity,
            });
        }
        Ok(())
    }
}
