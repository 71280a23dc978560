use std::time::Duration;

use tokio::time::Instant;

/// Accumulated float error tolerated when comparing token counts.
const EPSILON: f64 = 1e-9;

/// A capacity-bounded token counter with lazy, time-based refill.
///
/// The bucket has no timer of its own: every operation first credits
/// `elapsed * refill_rate` tokens, capped at `capacity`. Callers pass `now` explicitly so
/// the bucket is deterministic under test; the async wrapper uses `tokio::time::Instant`.
#[derive(Clone, Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(capacity: f64, refill_rate: f64, now: Instant) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_rate,
            last_refill: now,
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Takes `n` tokens, or reports how long until `n` tokens will be available at the
    /// current refill rate. A wait too long for a `Duration` saturates at `Duration::MAX`.
    pub fn try_take(&mut self, n: f64, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens + EPSILON >= n {
            self.tokens = (self.tokens - n).max(0.0);
            Ok(())
        } else {
            let deficit = n - self.tokens;
            Err(Duration::try_from_secs_f64(deficit / self.refill_rate).unwrap_or(Duration::MAX))
        }
    }

    /// Changes the refill rate from `now` on. Time elapsed before `now` is credited at the
    /// old rate.
    pub fn set_refill_rate(&mut self, refill_rate: f64, now: Instant) {
        self.refill(now);
        self.refill_rate = refill_rate;
    }
}
