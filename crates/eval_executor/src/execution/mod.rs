//! Per-task bookkeeping and the aggregate run report.

mod cancel;
mod observer;

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

pub use cancel::CancelHandle;
pub use observer::{NoopObserver, ProgressObserver, TaskEvent, TracingObserver};

use crate::{error::AttemptError, executor::StrategyKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// The run was cancelled before this task made its first attempt.
    DidNotRun,
}

impl ExecutionStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::DidNotRun => "did_not_run",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::DidNotRun
        )
    }

    const fn rank(&self) -> u8 {
        match self {
            ExecutionStatus::Pending => 0,
            ExecutionStatus::Running => 1,
            _ => 2,
        }
    }

    /// Statuses only move forward; nothing leaves a terminal status.
    pub const fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        next.rank() > self.rank()
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of one input's execution, addressed by its position in the input sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionDetails<O, E> {
    index: usize,
    status: ExecutionStatus,
    attempts: usize,
    rate_limited: usize,
    result: Option<O>,
    exceptions: Vec<AttemptError<E>>,
}

impl<O, E> ExecutionDetails<O, E> {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            status: ExecutionStatus::Pending,
            attempts: 0,
            rate_limited: 0,
            result: None,
            exceptions: Vec::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    /// Attempts counted against `max_retries`, including the successful one.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Attempts that were rate limited and retried without spending the retry budget.
    pub fn rate_limited_attempts(&self) -> usize {
        self.rate_limited
    }

    /// Present iff the status is `COMPLETED`.
    pub fn result(&self) -> Option<&O> {
        self.result.as_ref()
    }

    /// One entry per failed counted attempt, oldest first.
    pub fn exceptions(&self) -> &[AttemptError<E>] {
        &self.exceptions
    }

    pub fn last_error(&self) -> Option<&AttemptError<E>> {
        self.exceptions.last()
    }

    /// The output if the task completed, the details otherwise.
    pub fn into_result(mut self) -> Result<O, Self> {
        match self.result.take() {
            Some(output) => Ok(output),
            None => Err(self),
        }
    }

    /// Returns false (and leaves the record alone) for a backwards transition.
    pub(crate) fn transition(&mut self, next: ExecutionStatus) -> bool {
        if !self.status.can_transition_to(next) {
            error!(
                message = "Refusing backwards status transition.",
                index = self.index,
                from = %self.status,
                to = %next
            );
            return false;
        }
        self.status = next;
        true
    }

    /// Stores the output of a successful attempt. The caller owns the transition to
    /// `COMPLETED`.
    pub(crate) fn record_success(&mut self, output: O) {
        self.attempts += 1;
        self.result = Some(output);
    }

    pub(crate) fn record_failure(&mut self, error: AttemptError<E>) {
        self.attempts += 1;
        self.exceptions.push(error);
    }

    pub(crate) fn record_rate_limited(&mut self) {
        self.rate_limited += 1;
    }

    /// Whether the unit of work was ever invoked for this task.
    pub(crate) fn has_started(&self) -> bool {
        self.attempts > 0 || self.rate_limited > 0
    }
}

/// Counts per status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub did_not_run: usize,
}

impl RunSummary {
    pub fn from_statuses(statuses: impl IntoIterator<Item = ExecutionStatus>) -> Self {
        statuses
            .into_iter()
            .fold(RunSummary::default(), |mut summary, status| {
                summary.total += 1;
                match status {
                    ExecutionStatus::Pending => summary.pending += 1,
                    ExecutionStatus::Running => summary.running += 1,
                    ExecutionStatus::Completed => summary.completed += 1,
                    ExecutionStatus::Failed => summary.failed += 1,
                    ExecutionStatus::DidNotRun => summary.did_not_run += 1,
                }
                summary
            })
    }

    pub fn is_success(&self) -> bool {
        self.completed == self.total
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tasks: {} completed, {} failed, {} did not run",
            self.total, self.completed, self.failed, self.did_not_run
        )
    }
}

/// Final state of both controllers.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ControllerStats {
    pub refill_rate: f64,
    pub lowest_refill_rate: f64,
    pub rate_decreases: usize,
    pub rate_increases: usize,
    pub concurrency_limit: usize,
    pub peak_in_flight: usize,
}

/// Everything a run produced, in input order.
#[derive(Debug)]
pub struct RunReport<O, E> {
    pub(crate) strategy: StrategyKind,
    pub(crate) details: Vec<ExecutionDetails<O, E>>,
    pub(crate) summary: RunSummary,
    pub(crate) controllers: ControllerStats,
    pub(crate) elapsed: Duration,
}

impl<O, E> RunReport<O, E> {
    pub fn strategy(&self) -> StrategyKind {
        self.strategy
    }

    /// One record per input, `details()[i]` belongs to `inputs[i]`.
    pub fn details(&self) -> &[ExecutionDetails<O, E>] {
        &self.details
    }

    pub fn summary(&self) -> RunSummary {
        self.summary
    }

    pub fn controllers(&self) -> ControllerStats {
        self.controllers
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn len(&self) -> usize {
        self.details.len()
    }

    pub fn is_empty(&self) -> bool {
        self.details.is_empty()
    }

    pub fn results(&self) -> impl Iterator<Item = Result<&O, &ExecutionDetails<O, E>>> {
        self.details
            .iter()
            .map(|details| details.result().ok_or(details))
    }

    /// `output[i]` is the result for `inputs[i]`: the computed output, or the terminal
    /// details when the task did not complete.
    pub fn into_results(self) -> Vec<Result<O, ExecutionDetails<O, E>>> {
        self.details
            .into_iter()
            .map(ExecutionDetails::into_result)
            .collect()
    }
}
