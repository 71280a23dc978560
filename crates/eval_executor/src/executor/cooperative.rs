use futures::{StreamExt, stream};

use super::{ExecutorStrategy, RunContext, StrategyKind, driver::collect_ordered};
use crate::{
    adaptive_concurrency::retries::RetryLogic, error::ExecutorError,
    execution::ExecutionDetails, work::Work,
};

/// Multiplexes every task on the caller's own task.
///
/// Used when the caller already runs inside a tokio runtime: nothing is spawned and no
/// second scheduler is started, the task futures are polled in place by the future
/// returned from `execute`. At most `max_concurrency` task futures are live at once;
/// the concurrency controller gates how many of them are actually calling the unit of
/// work.
#[derive(Clone, Copy, Debug, Default)]
pub struct CooperativeExecutor;

impl ExecutorStrategy for CooperativeExecutor {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Cooperative
    }

    async fn execute<I, W, L>(
        &self,
        ctx: &RunContext<'_, W, L>,
        inputs: Vec<I>,
    ) -> Result<Vec<ExecutionDetails<W::Output, W::Error>>, ExecutorError>
    where
        I: Clone + Send,
        W: Work<I>,
        L: RetryLogic<W::Error>,
    {
        let live = ctx.config().max_concurrency.max(1);
        let records = stream::iter(inputs.into_iter().enumerate())
            .map(|(index, input)| ctx.drive(index, input))
            .buffer_unordered(live)
            .collect::<Vec<_>>()
            .await;
        Ok(collect_ordered(ctx.total(), records))
    }
}
