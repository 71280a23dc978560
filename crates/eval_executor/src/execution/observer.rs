use super::ExecutionStatus;

/// A status transition of one task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskEvent {
    pub index: usize,
    pub status: ExecutionStatus,
    pub attempts: usize,
    /// Tasks in a terminal status, including this one if it just finished.
    pub finished: usize,
    pub total: usize,
}

/// Receives every status transition of a run.
///
/// Called from worker threads and tasks, so implementations must be cheap and must not
/// block. Any `Fn(&TaskEvent)` closure is an observer.
pub trait ProgressObserver: Send + Sync {
    fn on_transition(&self, event: &TaskEvent);
}

impl<F> ProgressObserver for F
where
    F: Fn(&TaskEvent) + Send + Sync,
{
    fn on_transition(&self, event: &TaskEvent) {
        self(event)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {
    fn on_transition(&self, _event: &TaskEvent) {}
}

/// Logs progress through `tracing`: terminal transitions at `info`, the rest at `trace`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingObserver;

impl ProgressObserver for TracingObserver {
    fn on_transition(&self, event: &TaskEvent) {
        if event.status.is_terminal() {
            info!(
                target: "eval_executor::progress",
                index = event.index,
                status = %event.status,
                attempts = event.attempts,
                finished = event.finished,
                total = event.total,
                "Task finished."
            );
        } else {
            trace!(
                target: "eval_executor::progress",
                index = event.index,
                status = %event.status,
                "Task transitioned."
            );
        }
    }
}
