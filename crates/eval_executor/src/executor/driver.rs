//! The per-task algorithm shared by every strategy.
//!
//! A task moves through: mark `RUNNING` -> acquire a concurrency slot -> acquire rate
//! tokens -> call the unit of work (optionally under a timeout) -> classify the outcome
//! and feed it back into both controllers. Rate-limited attempts loop straight back to
//! slot acquisition; other recoverable failures sleep on a jittered exponential backoff
//! first. Cancellation is only observed at the suspension points before a call, never
//! in the middle of one.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::time::sleep;

use crate::{
    adaptive_concurrency::{
        ConcurrencyController, SlotFeedback, SlotPermit,
        internal_event::{AttemptRetried, InternalEvent, TaskFinished},
        retries::{FailureKind, Outcome, RetryLogic},
    },
    config::ExecutorConfig,
    error::{AttemptError, ConfigError},
    execution::{
        CancelHandle, ControllerStats, ExecutionDetails, ExecutionStatus, ProgressObserver,
        TaskEvent,
    },
    rate_limit::{AdaptiveRateController, TokenCost},
    work::Work,
};

type Attempt<W, I> = Outcome<<W as Work<I>>::Output, AttemptError<<W as Work<I>>::Error>>;

/// Shared state of one run: both controllers, cancellation and progress.
///
/// Built by [`EvalExecutor`](super::EvalExecutor) for every run and borrowed by all
/// workers; nothing in here outlives the run.
pub struct RunContext<'a, W, L> {
    work: &'a W,
    logic: &'a L,
    config: &'a ExecutorConfig,
    observer: &'a dyn ProgressObserver,
    /// Child of the caller's handle: cancelled by the caller or by fail-fast, the
    /// latter never leaking back to the caller.
    stop: CancelHandle,
    rate: AdaptiveRateController,
    concurrency: ConcurrencyController,
    cost: TokenCost,
    finished: AtomicUsize,
    total: usize,
}

impl<'a, W, L> RunContext<'a, W, L> {
    pub(crate) fn new(
        work: &'a W,
        logic: &'a L,
        config: &'a ExecutorConfig,
        observer: &'a dyn ProgressObserver,
        caller_cancel: &'a CancelHandle,
        total: usize,
    ) -> Result<Self, ConfigError> {
        let rate = AdaptiveRateController::new(config.rate_settings());
        let cost = rate.cost(config.tokens_per_task)?;
        Ok(Self {
            work,
            logic,
            config,
            observer,
            stop: caller_cancel.child(),
            rate,
            concurrency: ConcurrencyController::new(config.concurrency_settings()),
            cost,
            finished: AtomicUsize::new(0),
            total,
        })
    }

    pub fn config(&self) -> &ExecutorConfig {
        self.config
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Tasks that reached a terminal status so far.
    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::Acquire)
    }

    pub fn rate_controller(&self) -> &AdaptiveRateController {
        &self.rate
    }

    pub fn concurrency_controller(&self) -> &ConcurrencyController {
        &self.concurrency
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub(crate) fn controller_stats(&self) -> ControllerStats {
        let rate = self.rate.stats();
        ControllerStats {
            refill_rate: rate.refill_rate,
            lowest_refill_rate: rate.lowest_refill_rate,
            rate_decreases: rate.decreases,
            rate_increases: rate.increases,
            concurrency_limit: self.concurrency.current_concurrency(),
            peak_in_flight: self.concurrency.peak_in_flight(),
        }
    }

    fn transition<O, E>(&self, details: &mut ExecutionDetails<O, E>, status: ExecutionStatus) {
        if !details.transition(status) {
            return;
        }
        let finished = if status.is_terminal() {
            TaskFinished { status }.emit();
            self.finished.fetch_add(1, Ordering::AcqRel) + 1
        } else {
            self.finished()
        };
        self.observer.on_transition(&TaskEvent {
            index: details.index(),
            status,
            attempts: details.attempts(),
            finished,
            total: self.total,
        });
    }

    fn finish<O, E>(
        &self,
        mut details: ExecutionDetails<O, E>,
        status: ExecutionStatus,
    ) -> ExecutionDetails<O, E> {
        self.transition(&mut details, status);
        details
    }

    /// Ends a task the run stopped admitting. Tasks that never called the unit of work
    /// did not run; tasks that did keep their attempts and end failed.
    fn abandon<O, E>(&self, details: ExecutionDetails<O, E>) -> ExecutionDetails<O, E> {
        let status = if details.has_started() {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::DidNotRun
        };
        debug!(
            message = "Run stopped; task not admitted.",
            index = details.index(),
            status = %status
        );
        self.finish(details, status)
    }

    async fn admit_slot(&self) -> Option<SlotPermit<'_>> {
        if self.is_stopped() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => None,
            slot = self.concurrency.acquire_slot() => slot.ok(),
        }
    }

    async fn admit_tokens(&self) -> bool {
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => false,
            _ = self.rate.acquire_cost(self.cost) => true,
        }
    }

    /// Runs one task to a terminal status.
    pub async fn drive<I>(&self, index: usize, input: I) -> ExecutionDetails<W::Output, W::Error>
    where
        I: Clone,
        W: Work<I>,
        L: RetryLogic<W::Error>,
    {
        let mut details = ExecutionDetails::new(index);
        if self.is_stopped() {
            return self.finish(details, ExecutionStatus::DidNotRun);
        }
        self.transition(&mut details, ExecutionStatus::Running);
        let mut backoff = self.config.backoff();

        loop {
            let Some(slot) = self.admit_slot().await else {
                return self.abandon(details);
            };
            if !self.admit_tokens().await {
                drop(slot);
                return self.abandon(details);
            }

            let (error, kind) = match self.attempt(input.clone()).await {
                Outcome::Success(output) => {
                    self.rate.record_success();
                    slot.release(SlotFeedback::Success);
                    details.record_success(output);
                    return self.finish(details, ExecutionStatus::Completed);
                }
                Outcome::RateLimited(error) => {
                    self.rate.record_rate_limited();
                    slot.release(SlotFeedback::CapacityExceeded);
                    if !self.config.count_rate_limits_as_attempts
                        && details.rate_limited_attempts() < self.config.max_rate_limit_retries
                    {
                        details.record_rate_limited();
                        AttemptRetried {
                            reason: FailureKind::RateLimited.as_str(),
                        }
                        .emit();
                        warn!(
                            message = "Rate limited; retrying without spending the retry budget.",
                            index,
                            rate_limited_attempts = details.rate_limited_attempts()
                        );
                        continue;
                    }
                    (error, FailureKind::RateLimited)
                }
                Outcome::TransientFailure(error) => {
                    let feedback = if error.is_timeout() {
                        SlotFeedback::CapacityExceeded
                    } else {
                        SlotFeedback::Failure
                    };
                    slot.release(feedback);
                    (error, FailureKind::Transient)
                }
                Outcome::FatalFailure(error) => {
                    slot.release(SlotFeedback::Failure);
                    (error, FailureKind::Fatal)
                }
            };

            details.record_failure(error);

            if kind == FailureKind::Fatal {
                error!(
                    message = "Non-retriable error; task failed.",
                    index,
                    attempts = details.attempts()
                );
                if self.config.fail_fast && !self.stop.is_cancelled() {
                    warn!(
                        message = "Fail-fast enabled; cancelling tasks that have not started.",
                        index
                    );
                    self.stop.cancel();
                }
                return self.finish(details, ExecutionStatus::Failed);
            }

            if details.attempts() >= self.config.max_retries {
                error!(
                    message = "Retries exhausted; task failed.",
                    index,
                    attempts = details.attempts()
                );
                return self.finish(details, ExecutionStatus::Failed);
            }

            let delay = self.config.jitter.apply(backoff.next_delay());
            AttemptRetried {
                reason: kind.as_str(),
            }
            .emit();
            warn!(
                message = "Retrying after error.",
                index,
                attempts = details.attempts(),
                delay_ms = %delay.as_millis()
            );
            let slept = tokio::select! {
                biased;
                _ = self.stop.cancelled() => false,
                _ = sleep(delay) => true,
            };
            if !slept {
                return self.abandon(details);
            }
        }
    }

    async fn attempt<I>(&self, input: I) -> Attempt<W, I>
    where
        W: Work<I>,
        L: RetryLogic<W::Error>,
    {
        let call = self.work.call(input);
        let result = match self.config.per_attempt_timeout() {
            Some(after) => match tokio::time::timeout(after, call).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    warn!(message = "Attempt timed out.", timeout_ms = %after.as_millis());
                    return Outcome::TransientFailure(AttemptError::TimedOut { after });
                }
            },
            None => call.await,
        };
        Outcome::classify(result, self.logic).map_err(AttemptError::Failed)
    }
}

/// Places every record at its input position. A position nobody reported (its worker
/// panicked mid-task) is recorded as failed rather than dropped.
pub(crate) fn collect_ordered<O, E>(
    total: usize,
    records: impl IntoIterator<Item = ExecutionDetails<O, E>>,
) -> Vec<ExecutionDetails<O, E>> {
    let mut slots: Vec<Option<ExecutionDetails<O, E>>> = (0..total).map(|_| None).collect();
    for record in records {
        let index = record.index();
        match slots.get_mut(index) {
            Some(slot) => *slot = Some(record),
            None => error!(message = "Discarding record with out-of-range index.", index, total),
        }
    }

    slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.unwrap_or_else(|| {
                error!(message = "Task produced no record; marking it failed.", index);
                let mut details = ExecutionDetails::new(index);
                details.transition(ExecutionStatus::Failed);
                details
            })
        })
        .collect()
}
