// examples/simulated_provider.rs
//
// Evaluates a batch of prompts against an in-process "provider" that answers 429 once
// more than `PROVIDER_RPS` calls start within a second, and occasionally fails with a
// 503. Run with `RUST_LOG=eval_executor=debug` to watch both controllers adapt.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use eval_executor::{
    EvalExecutor, ExecutorConfig, FailureKind, RunReport, execution::TracingObserver,
};
use parking_lot::Mutex;
use snafu::Snafu;
use tokio::time::{Instant, sleep};
use tracing::info;

const PROVIDER_RPS: usize = 15;
const NUM_PROMPTS: usize = 60;
const TRANSIENT_FAILURE_RATE: f64 = 0.05;

#[derive(Debug, Snafu)]
enum ProviderError {
    #[snafu(display("429 Too Many Requests"))]
    TooManyRequests,
    #[snafu(display("503 Service Unavailable"))]
    Unavailable,
    #[snafu(display("400 Bad Request: {reason}"))]
    BadRequest { reason: String },
}

fn classify(error: &ProviderError) -> FailureKind {
    match error {
        ProviderError::TooManyRequests => FailureKind::RateLimited,
        ProviderError::Unavailable => FailureKind::Transient,
        ProviderError::BadRequest { .. } => FailureKind::Fatal,
    }
}

/// Sliding one-second window of call starts.
#[derive(Default)]
struct SimulatedProvider {
    recent: Mutex<VecDeque<Instant>>,
}

impl SimulatedProvider {
    async fn complete(&self, prompt: String) -> Result<String, ProviderError> {
        let now = Instant::now();
        {
            let mut recent = self.recent.lock();
            while recent
                .front()
                .is_some_and(|start| now.duration_since(*start) > Duration::from_secs(1))
            {
                recent.pop_front();
            }
            if recent.len() >= PROVIDER_RPS {
                return Err(ProviderError::TooManyRequests);
            }
            recent.push_back(now);
        }

        if prompt.is_empty() {
            return Err(ProviderError::BadRequest {
                reason: "empty prompt".to_string(),
            });
        }
        let latency = Duration::from_millis(50 + rand::random::<u64>() % 150);
        sleep(latency).await;
        if rand::random::<f64>() < TRANSIENT_FAILURE_RATE {
            return Err(ProviderError::Unavailable);
        }
        Ok(prompt.to_uppercase())
    }
}

fn prompts() -> Vec<String> {
    (0..NUM_PROMPTS)
        .map(|i| {
            if i == NUM_PROMPTS / 2 {
                String::new()
            } else {
                format!("prompt #{i}")
            }
        })
        .collect()
}

fn print_report(report: &RunReport<String, ProviderError>) {
    let controllers = report.controllers();
    info!(
        strategy = %report.strategy(),
        summary = %report.summary(),
        elapsed_ms = %report.elapsed().as_millis(),
        final_rate = controllers.refill_rate,
        lowest_rate = controllers.lowest_refill_rate,
        rate_decreases = controllers.rate_decreases,
        concurrency_limit = controllers.concurrency_limit,
        peak_in_flight = controllers.peak_in_flight,
        "Run finished."
    );
    for details in report.details().iter().filter(|d| d.result().is_none()) {
        info!(
            index = details.index(),
            status = %details.status(),
            attempts = details.attempts(),
            last_error = ?details.last_error().map(ToString::to_string),
            "Task did not complete."
        );
    }
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();

    let provider = Arc::new(SimulatedProvider::default());
    let work = {
        let provider = Arc::clone(&provider);
        move |prompt: String| {
            let provider = Arc::clone(&provider);
            async move { provider.complete(prompt).await }
        }
    };
    let config = ExecutorConfig::builder()
        .initial_rate(40.0)
        .max_rate(60.0)
        .bucket_capacity(20.0)
        .initial_concurrency(16)
        .max_concurrency(16)
        .max_retries(4)
        .per_attempt_timeout_ms(2_000)
        .build();
    let executor = EvalExecutor::new(work, classify, config).with_observer(TracingObserver);

    // No runtime on this thread: a pool of worker threads.
    let report = executor.run_blocking(prompts())?;
    print_report(&report);

    // Inside a runtime: every task is polled on the caller's task.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let report = runtime.block_on(executor.run(prompts()))?;
    print_report(&report);

    Ok(())
}
