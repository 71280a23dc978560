use std::{iter::Enumerate, thread, vec::IntoIter};

use parking_lot::Mutex;
use tokio::runtime::{Builder, Runtime};

use super::{ExecutorStrategy, RunContext, StrategyKind, driver::collect_ordered};
use crate::{
    adaptive_concurrency::retries::RetryLogic,
    error::{ExecutorError, RuntimeBuildSnafu},
    execution::ExecutionDetails,
    work::Work,
};
use snafu::ResultExt;

type Queue<I> = Mutex<Enumerate<IntoIter<I>>>;
type Records<T, E> = Mutex<Vec<ExecutionDetails<T, E>>>;

/// A fixed pool of OS threads pulling tasks from a shared queue.
///
/// Used when no scheduler is running on the calling thread. Every worker owns a
/// single-threaded tokio runtime and processes one task at a time; the controllers are
/// shared by reference across the pool. The calling thread blocks until the queue is
/// drained and every worker has returned.
#[derive(Clone, Copy, Debug, Default)]
pub struct WorkerPoolExecutor;

impl WorkerPoolExecutor {
    fn build_runtimes(workers: usize) -> Result<Vec<Runtime>, ExecutorError> {
        (0..workers)
            .map(|worker| {
                Builder::new_current_thread()
                    .enable_all()
                    .thread_name(format!("eval-worker-{worker}"))
                    .build()
                    .context(RuntimeBuildSnafu { worker })
            })
            .collect()
    }

    fn run_pool<I, W, L>(
        ctx: &RunContext<'_, W, L>,
        inputs: Vec<I>,
    ) -> Result<Vec<ExecutionDetails<W::Output, W::Error>>, ExecutorError>
    where
        I: Clone + Send,
        W: Work<I>,
        L: RetryLogic<W::Error>,
    {
        let workers = ctx.config().worker_count(inputs.len());
        let runtimes = Self::build_runtimes(workers)?;
        let queue: Queue<I> = Mutex::new(inputs.into_iter().enumerate());
        let records = Mutex::new(Vec::with_capacity(ctx.total()));
        debug!(message = "Starting worker pool.", workers);

        thread::scope(|scope| {
            let handles: Vec<_> = runtimes
                .into_iter()
                .enumerate()
                .map(|(worker, runtime)| {
                    let (queue, records) = (&queue, &records);
                    scope.spawn(move || {
                        runtime.block_on(worker_loop(ctx, queue, records, worker))
                    })
                })
                .collect();

            for (worker, handle) in handles.into_iter().enumerate() {
                if handle.join().is_err() {
                    error!(message = "Worker panicked; its in-flight task is lost.", worker);
                }
            }
        });

        Ok(collect_ordered(ctx.total(), records.into_inner()))
    }
}

/// Drains the queue one task at a time, publishing each record as soon as it is final.
async fn worker_loop<I, W, L>(
    ctx: &RunContext<'_, W, L>,
    queue: &Queue<I>,
    records: &Records<W::Output, W::Error>,
    worker: usize,
) where
    I: Clone,
    W: Work<I>,
    L: RetryLogic<W::Error>,
{
    let mut tasks = 0usize;
    loop {
        let next = queue.lock().next();
        let Some((index, input)) = next else {
            break;
        };
        let details = ctx.drive(index, input).await;
        records.lock().push(details);
        tasks += 1;
    }
    trace!(message = "Worker drained.", worker, tasks);
}

impl ExecutorStrategy for WorkerPoolExecutor {
    fn kind(&self) -> StrategyKind {
        StrategyKind::WorkerPool
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
        Self::run_pool(ctx, inputs)
    }
}
