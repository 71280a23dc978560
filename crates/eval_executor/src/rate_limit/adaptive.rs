use parking_lot::Mutex;
use tokio::time::{Instant, sleep};

use super::{RateSettings, TokenBucket};
use crate::{
    adaptive_concurrency::internal_event::{InternalEvent, RateLimitAdjusted},
    error::ConfigError,
};

/// A token amount that has been checked against the bucket's capacity, so acquiring it
/// can always eventually succeed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TokenCost(f64);

impl TokenCost {
    pub fn get(&self) -> f64 {
        self.0
    }
}

/// Snapshot of the controller, for the run report.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateStats {
    pub refill_rate: f64,
    pub lowest_refill_rate: f64,
    pub decreases: usize,
    pub increases: usize,
}

#[derive(Debug)]
struct State {
    bucket: TokenBucket,
    success_streak: usize,
    stats: RateStats,
}

/// Token bucket whose refill rate follows an AIMD rule.
///
/// Bucket contents, refill rate and streak live behind a single lock, so concurrent
/// `acquire` calls can never hand out the same tokens twice and a rate-limit signal is
/// visible to the very next acquire.
#[derive(Debug)]
pub struct AdaptiveRateController {
    settings: RateSettings,
    state: Mutex<State>,
}

impl AdaptiveRateController {
    pub fn new(settings: RateSettings) -> Self {
        let rate = settings
            .initial_rate
            .clamp(settings.min_rate, settings.max_rate);
        Self {
            settings,
            state: Mutex::new(State {
                bucket: TokenBucket::new(settings.capacity, rate, Instant::now()),
                success_streak: 0,
                stats: RateStats {
                    refill_rate: rate,
                    lowest_refill_rate: rate,
                    decreases: 0,
                    increases: 0,
                },
            }),
        }
    }

    pub fn cost(&self, n: f64) -> Result<TokenCost, ConfigError> {
        self.settings.check_cost(n).map(|()| TokenCost(n))
    }

    /// Suspends until `n` tokens are available, then takes them.
    ///
    /// Fails immediately if `n` can never be satisfied.
    pub async fn acquire(&self, n: f64) -> Result<(), ConfigError> {
        let cost = self.cost(n)?;
        self.acquire_cost(cost).await;
        Ok(())
    }

    pub async fn acquire_cost(&self, cost: TokenCost) {
        loop {
            let wait = match self.state.lock().bucket.try_take(cost.0, Instant::now()) {
                Ok(()) => return,
                Err(wait) => wait,
            };
            // The rate may change while we sleep; the next pass re-evaluates.
            sleep(wait).await;
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.success_streak += 1;
        if state.success_streak < self.settings.success_threshold {
            return;
        }
        state.success_streak = 0;

        let current = state.bucket.refill_rate();
        let next = (current + self.settings.increase_step).min(self.settings.max_rate);
        if next > current {
            state.bucket.set_refill_rate(next, Instant::now());
            state.stats.refill_rate = next;
            state.stats.increases += 1;
            RateLimitAdjusted {
                refill_rate: next,
                decreased: false,
            }
            .emit();
        }
    }

    pub fn record_rate_limited(&self) {
        let mut state = self.state.lock();
        state.success_streak = 0;

        let current = state.bucket.refill_rate();
        let next = (current * self.settings.decrease_factor).max(self.settings.min_rate);
        if next < current {
            state.bucket.set_refill_rate(next, Instant::now());
            state.stats.refill_rate = next;
            state.stats.lowest_refill_rate = state.stats.lowest_refill_rate.min(next);
            state.stats.decreases += 1;
            warn!(
                message = "Rate limited; backing off.",
                refill_rate = next,
                previous_rate = current
            );
            RateLimitAdjusted {
                refill_rate: next,
                decreased: true,
            }
            .emit();
        }
    }

    pub fn refill_rate(&self) -> f64 {
        self.state.lock().bucket.refill_rate()
    }

    /// Tokens currently in the bucket, refilled up to now.
    pub fn available_tokens(&self) -> f64 {
        let mut state = self.state.lock();
        state.bucket.refill(Instant::now());
        state.bucket.tokens()
    }

    pub fn stats(&self) -> RateStats {
        self.state.lock().stats
    }
}
