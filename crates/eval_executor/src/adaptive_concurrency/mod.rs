//! Limit the max number of units of work being concurrently processed.
//!
//! The limit adapts with an AIMD rule: a streak of successes adds one slot, a
//! capacity signal (rate limit or timeout) multiplies the limit by `decrease_ratio`.
//! Resizing only changes how many *new* slots are granted; a slot already handed to a
//! running task is never revoked.

pub mod internal_event;
pub mod retries;

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::{AcquireError, Semaphore, SemaphorePermit};

use internal_event::{ConcurrencyLimitAdjusted, InternalEvent, SlotsInFlight};

/// Bounds and tuning of the concurrency controller.
///
/// | Parameter | Description |
/// |-----------|-------------|
/// | `initial_concurrency` | Slots available when the run starts |
/// | `min_concurrency` | Floor; a capacity signal never shrinks the limit below this |
/// | `max_concurrency` | Ceiling for additive increase |
/// | `adaptive` | When false the limit stays at `initial_concurrency` |
/// | `success_threshold` | Consecutive successes needed for one additive step |
/// | `decrease_ratio` | Multiplicative decrease factor, 0 < ratio < 1 |
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConcurrencySettings {
    pub initial_concurrency: usize,
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub adaptive: bool,
    pub success_threshold: usize,
    pub decrease_ratio: f64,
}

impl ConcurrencySettings {
    /// A limit that never moves.
    pub const fn fixed(concurrency: usize) -> Self {
        Self {
            initial_concurrency: concurrency,
            min_concurrency: concurrency,
            max_concurrency: concurrency,
            adaptive: false,
            success_threshold: 1,
            decrease_ratio: 0.5,
        }
    }
}

/// What a finished attempt tells the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotFeedback {
    Success,
    /// Rate limited or timed out: the downstream service is saturated.
    CapacityExceeded,
    /// Any other failure. Breaks the success streak without shrinking the limit.
    Failure,
}

#[derive(Debug)]
struct Inner {
    current_limit: usize,
    /// Permits still to be retired because the limit shrank while they were held.
    pending_shrink: usize,
    success_streak: usize,
}

#[derive(Debug)]
pub struct ConcurrencyController {
    settings: ConcurrencySettings,
    semaphore: Semaphore,
    inner: Mutex<Inner>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// A granted slot. Hand it back with [`SlotPermit::release`]; dropping it releases the
/// slot without feeding any outcome into the controller.
#[derive(Debug)]
#[must_use = "dropping the permit releases the slot immediately"]
pub struct SlotPermit<'a> {
    permit: Option<SemaphorePermit<'a>>,
    controller: &'a ConcurrencyController,
}

impl ConcurrencyController {
    pub fn new(settings: ConcurrencySettings) -> Self {
        let initial = settings
            .initial_concurrency
            .clamp(settings.min_concurrency.max(1), settings.max_concurrency.max(1));
        Self {
            settings,
            semaphore: Semaphore::new(initial),
            inner: Mutex::new(Inner {
                current_limit: initial,
                pending_shrink: 0,
                success_streak: 0,
            }),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Suspends until a slot is free. A granted slot never takes the number in flight
    /// above the current limit.
    pub async fn acquire_slot(&self) -> Result<SlotPermit<'_>, AcquireError> {
        let (permit, in_flight) = loop {
            let permit = self.semaphore.acquire().await?;
            let mut inner = self.inner.lock();
            // Handed over by a release that raced with a shrink: retire it and wait again.
            if inner.pending_shrink > 0 {
                inner.pending_shrink -= 1;
                permit.forget();
                continue;
            }
            break (permit, self.in_flight.fetch_add(1, Ordering::AcqRel) + 1);
        };
        self.peak_in_flight.fetch_max(in_flight, Ordering::AcqRel);
        SlotsInFlight {
            in_flight: in_flight as u64,
        }
        .emit();
        Ok(SlotPermit {
            permit: Some(permit),
            controller: self,
        })
    }

    pub fn current_concurrency(&self) -> usize {
        self.inner.lock().current_limit
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Acquire)
    }

    fn complete(&self, permit: SemaphorePermit<'_>, feedback: Option<SlotFeedback>) {
        let mut inner = self.inner.lock();
        self.in_flight.fetch_sub(1, Ordering::AcqRel);

        match feedback {
            Some(SlotFeedback::Success) if self.settings.adaptive => {
                inner.success_streak += 1;
                if inner.success_streak >= self.settings.success_threshold {
                    inner.success_streak = 0;
                    self.grow(&mut inner);
                }
            }
            Some(SlotFeedback::CapacityExceeded) => {
                inner.success_streak = 0;
                if self.settings.adaptive {
                    self.shrink(&mut inner);
                }
            }
            Some(SlotFeedback::Failure) => inner.success_streak = 0,
            Some(SlotFeedback::Success) | None => {}
        }

        if inner.pending_shrink > 0 {
            inner.pending_shrink -= 1;
            permit.forget();
        } else {
            drop(permit);
        }
    }

    fn grow(&self, inner: &mut Inner) {
        if inner.current_limit >= self.settings.max_concurrency {
            return;
        }
        inner.current_limit += 1;
        // Cancel a pending retirement before minting a new permit.
        if inner.pending_shrink > 0 {
            inner.pending_shrink -= 1;
        } else {
            self.semaphore.add_permits(1);
        }
        debug!(
            message = "Concurrency limit increased.",
            limit = inner.current_limit
        );
        ConcurrencyLimitAdjusted {
            limit: inner.current_limit as u64,
        }
        .emit();
    }

    fn shrink(&self, inner: &mut Inner) {
        let floor = self.settings.min_concurrency.max(1);
        let target = ((inner.current_limit as f64 * self.settings.decrease_ratio).floor()
            as usize)
            .max(floor);
        if target >= inner.current_limit {
            return;
        }
        let excess = inner.current_limit - target;
        inner.current_limit = target;
        let forgotten = self.semaphore.forget_permits(excess);
        inner.pending_shrink += excess - forgotten;
        debug!(
            message = "Concurrency limit decreased.",
            limit = target,
            retiring_held_permits = excess - forgotten
        );
        ConcurrencyLimitAdjusted {
            limit: target as u64,
        }
        .emit();
    }
}

impl SlotPermit<'_> {
    /// Frees the slot and feeds the attempt's outcome into the adaptation policy.
    pub fn release(mut self, feedback: SlotFeedback) {
        if let Some(permit) = self.permit.take() {
            self.controller.complete(permit, Some(feedback));
        }
    }
}

impl Drop for SlotPermit<'_> {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.controller.complete(permit, None);
        }
    }
}
