//! Drives a run to completion.
//!
//! Two strategies implement [`ExecutorStrategy`] and differ only in how task futures
//! are driven:
//!
//! - [`CooperativeExecutor`] polls every task on the caller's task, for callers that
//!   already run inside a tokio runtime;
//! - [`WorkerPoolExecutor`] spins up a fixed pool of threads, each with its own
//!   single-threaded runtime, for callers that do not.
//!
//! Both call the same per-task algorithm, [`RunContext::drive`], so retry, ordering and
//! controller-adaptation semantics cannot drift between them. [`select_executor`] picks
//! the strategy by inspecting the calling thread.

mod cooperative;
mod driver;
mod worker_pool;

use std::{fmt, future::Future, sync::Arc};

use futures::future::Either;
use serde::Serialize;
use tokio::time::Instant;

pub use driver::RunContext;
pub use cooperative::CooperativeExecutor;
pub use worker_pool::WorkerPoolExecutor;

use crate::{
    adaptive_concurrency::retries::RetryLogic,
    config::ExecutorConfig,
    error::ExecutorError,
    execution::{
        CancelHandle, ExecutionDetails, NoopObserver, ProgressObserver, RunReport, RunSummary,
    },
    work::Work,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Cooperative,
    WorkerPool,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::Cooperative => f.write_str("cooperative"),
            StrategyKind::WorkerPool => f.write_str("worker_pool"),
        }
    }
}

/// How the tasks of a run are scheduled.
///
/// Implementations must produce exactly one record per input, at the input's position,
/// and must run every task through [`RunContext::drive`].
pub trait ExecutorStrategy {
    fn kind(&self) -> StrategyKind;

    fn execute<I, W, L>(
        &self,
        ctx: &RunContext<'_, W, L>,
        inputs: Vec<I>,
    ) -> impl Future<Output = Result<Vec<ExecutionDetails<W::Output, W::Error>>, ExecutorError>>
    where
        I: Clone + Send,
        W: Work<I>,
        L: RetryLogic<W::Error>;
}

/// The strategy chosen by [`select_executor`].
#[derive(Clone, Copy, Debug)]
pub enum Strategy {
    Cooperative(CooperativeExecutor),
    WorkerPool(WorkerPoolExecutor),
}

impl ExecutorStrategy for Strategy {
    fn kind(&self) -> StrategyKind {
        match self {
            Strategy::Cooperative(executor) => executor.kind(),
            Strategy::WorkerPool(executor) => executor.kind(),
        }
    }

    fn execute<I, W, L>(
        &self,
        ctx: &RunContext<'_, W, L>,
        inputs: Vec<I>,
    ) -> impl Future<Output = Result<Vec<ExecutionDetails<W::Output, W::Error>>, ExecutorError>>
    where
        I: Clone + Send,
        W: Work<I>,
        L: RetryLogic<W::Error>,
    {
        match self {
            Strategy::Cooperative(executor) => Either::Left(executor.execute(ctx, inputs)),
            Strategy::WorkerPool(executor) => Either::Right(executor.execute(ctx, inputs)),
        }
    }
}

/// Whether the calling thread is inside a tokio runtime. Pure inspection.
pub fn scheduler_active() -> bool {
    tokio::runtime::Handle::try_current().is_ok()
}

/// Cooperative inside a runtime, so no nested runtime is ever started; a worker pool
/// otherwise.
pub fn select_executor() -> Strategy {
    if scheduler_active() {
        Strategy::Cooperative(CooperativeExecutor)
    } else {
        Strategy::WorkerPool(WorkerPoolExecutor)
    }
}

/// Runs a unit of work over an ordered collection of inputs.
///
/// # Example
///
/// ```rust
/// use eval_executor::{
///     EvalExecutor, ExecutorConfig, ExecutionStatus,
///     adaptive_concurrency::retries::FailureKind,
/// };
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let executor = EvalExecutor::new(
///     |prompt: String| async move { Ok::<_, String>(prompt.len()) },
///     |_: &String| FailureKind::Transient,
///     ExecutorConfig::builder().initial_rate(50.0).build(),
/// );
///
/// let report = executor.run(vec!["a".to_string(), "bcd".to_string()]).await?;
/// assert_eq!(report.summary().completed, 2);
/// assert_eq!(report.details()[1].result(), Some(&3));
/// assert_eq!(report.details()[1].status(), ExecutionStatus::Completed);
/// # Ok(())
/// # }
/// ```
pub struct EvalExecutor<W, L> {
    work: W,
    logic: L,
    config: ExecutorConfig,
    observer: Arc<dyn ProgressObserver>,
    cancel: CancelHandle,
}

impl<W, L> EvalExecutor<W, L> {
    pub fn new(work: W, logic: L, config: ExecutorConfig) -> Self {
        Self {
            work,
            logic,
            config,
            observer: Arc::new(NoopObserver),
            cancel: CancelHandle::new(),
        }
    }

    pub fn with_observer(mut self, observer: impl ProgressObserver + 'static) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    /// Cancelling the returned handle stops every current and future run of this
    /// executor from admitting new attempts.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Runs every input with the strategy [`select_executor`] picks for this thread.
    pub async fn run<I>(
        &self,
        inputs: Vec<I>,
    ) -> Result<RunReport<W::Output, W::Error>, ExecutorError>
    where
        I: Clone + Send,
        W: Work<I>,
        L: RetryLogic<W::Error>,
    {
        self.run_with(select_executor(), inputs).await
    }

    /// Blocking entry point for callers without a runtime. Runs on a worker pool.
    pub fn run_blocking<I>(
        &self,
        inputs: Vec<I>,
    ) -> Result<RunReport<W::Output, W::Error>, ExecutorError>
    where
        I: Clone + Send,
        W: Work<I>,
        L: RetryLogic<W::Error>,
    {
        if scheduler_active() {
            return Err(ExecutorError::BlockingInsideScheduler);
        }
        futures::executor::block_on(self.run_with(WorkerPoolExecutor, inputs))
    }

    /// Runs every input with an explicit strategy.
    pub async fn run_with<S, I>(
        &self,
        strategy: S,
        inputs: Vec<I>,
    ) -> Result<RunReport<W::Output, W::Error>, ExecutorError>
    where
        S: ExecutorStrategy,
        I: Clone + Send,
        W: Work<I>,
        L: RetryLogic<W::Error>,
    {
        self.config.validate()?;
        let total = inputs.len();
        let ctx = RunContext::new(
            &self.work,
            &self.logic,
            &self.config,
            &*self.observer,
            &self.cancel,
            total,
        )?;

        let kind = strategy.kind();
        info!(message = "Starting evaluation run.", tasks = total, strategy = %kind);
        let started = Instant::now();

        let details = strategy.execute(&ctx, inputs).await?;

        let summary = RunSummary::from_statuses(details.iter().map(ExecutionDetails::status));
        let controllers = ctx.controller_stats();
        let elapsed = started.elapsed();
        info!(
            message = "Evaluation run finished.",
            completed = summary.completed,
            failed = summary.failed,
            did_not_run = summary.did_not_run,
            refill_rate = controllers.refill_rate,
            concurrency_limit = controllers.concurrency_limit,
            elapsed_ms = %elapsed.as_millis()
        );

        Ok(RunReport {
            strategy: kind,
            details,
            summary,
            controllers,
            elapsed,
        })
    }
}

#[cfg(test)]
mod tests;
