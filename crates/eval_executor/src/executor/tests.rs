use std::{sync::Arc, time::Duration};

use metrics_util::debugging::{DebugValue, DebuggingRecorder};
use parking_lot::Mutex;
use tokio::time::sleep;

use super::*;
use crate::{
    adaptive_concurrency::retries::JitterMode,
    error::{AttemptError, ConfigError},
    execution::{ExecutionStatus, TaskEvent},
    test_utils::{CallLog, Failure, classify, scripted, trace_init},
    work::ServiceWork,
};

// `DebugValue` does not implement `Clone`; rebuild an owned copy for comparison.
fn owned(value: &DebugValue) -> DebugValue {
    match value {
        DebugValue::Counter(c) => DebugValue::Counter(*c),
        DebugValue::Gauge(g) => DebugValue::Gauge(*g),
        DebugValue::Histogram(h) => DebugValue::Histogram(h.clone()),
    }
}

fn no_delay(_: usize) -> Duration {
    Duration::ZERO
}

fn inputs(n: usize) -> Vec<usize> {
    (0..n).collect()
}

fn config() -> ExecutorConfig {
    ExecutorConfig {
        initial_rate: 100.0,
        max_rate: 100.0,
        bucket_capacity: 50.0,
        initial_concurrency: 8,
        max_concurrency: 8,
        backoff_factor_ms: 1,
        jitter: JitterMode::None,
        ..ExecutorConfig::default()
    }
}

/// One slot, never resized: tasks run strictly one after another in input order.
fn serial_config() -> ExecutorConfig {
    ExecutorConfig {
        initial_concurrency: 1,
        min_concurrency: 1,
        max_concurrency: 1,
        adaptive_concurrency: false,
        workers: Some(1),
        ..config()
    }
}

fn statuses<O, E>(details: &[ExecutionDetails<O, E>]) -> Vec<ExecutionStatus> {
    details.iter().map(ExecutionDetails::status).collect()
}

#[tokio::test(start_paused = true)]
async fn results_follow_input_order() {
    trace_init();
    let log = CallLog::new();
    // Later inputs finish first.
    let work = scripted(
        &log,
        |input| Duration::from_millis(10 * (8 - input) as u64),
        |input, _| Ok(input * 2),
    );
    let executor = EvalExecutor::new(work, classify, config());

    let report = executor.run(inputs(8)).await.unwrap();

    assert_eq!(report.strategy(), StrategyKind::Cooperative);
    assert_eq!(report.len(), 8);
    assert!(report.summary().is_success());
    for (position, details) in report.details().iter().enumerate() {
        assert_eq!(details.index(), position);
        assert_eq!(details.attempts(), 1);
        assert!(details.exceptions().is_empty());
    }
    let outputs: Vec<_> = report.into_results().into_iter().map(Result::ok).collect();
    assert_eq!(outputs, (0..8).map(|i| Some(i * 2)).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn empty_input_yields_empty_report() {
    let log = CallLog::new();
    let executor = EvalExecutor::new(scripted(&log, no_delay, |i, _| Ok(i)), classify, config());

    let report = executor.run(Vec::<usize>::new()).await.unwrap();

    assert!(report.is_empty());
    assert_eq!(report.summary().total, 0);
    assert_eq!(log.total_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_exhaust_retries() {
    let log = CallLog::new();
    let work = scripted(&log, no_delay, |input, _| Err(Failure::Transient(input)));
    let executor = EvalExecutor::new(
        work,
        classify,
        ExecutorConfig {
            max_retries: 3,
            ..config()
        },
    );

    let report = executor.run(vec![0usize]).await.unwrap();

    let details = &report.details()[0];
    assert_eq!(details.status(), ExecutionStatus::Failed);
    assert_eq!(details.attempts(), 3);
    assert_eq!(details.exceptions().len(), 3);
    assert_eq!(details.result(), None);
    assert_eq!(
        details.last_error().and_then(AttemptError::as_failure),
        Some(&Failure::Transient(0))
    );
    assert_eq!(log.calls(0), 3);
    assert_eq!(report.summary().failed, 1);
}

#[tokio::test(start_paused = true)]
async fn retried_inputs_record_their_attempts() {
    let log = CallLog::new();
    let work = scripted(&log, no_delay, |input, call| {
        if (input == 3 || input == 7) && call == 1 {
            Err(Failure::Transient(input))
        } else {
            Ok(input * 10)
        }
    });
    let executor = EvalExecutor::new(
        work,
        classify,
        ExecutorConfig {
            max_retries: 2,
            ..config()
        },
    );

    let report = executor.run(inputs(10)).await.unwrap();

    assert!(report.summary().is_success());
    for details in report.details() {
        let expected = if matches!(details.index(), 3 | 7) { 2 } else { 1 };
        assert_eq!(details.attempts(), expected, "input {}", details.index());
        assert_eq!(details.exceptions().len(), expected - 1);
        assert_eq!(details.result(), Some(&(details.index() * 10)));
    }
}

#[tokio::test(start_paused = true)]
async fn rate_limits_slow_the_run_without_spending_retries() {
    let log = CallLog::new();
    let work = scripted(&log, no_delay, |input, call| {
        if call == 1 {
            Err(Failure::RateLimited)
        } else {
            Ok(input)
        }
    });
    let executor = EvalExecutor::new(
        work,
        classify,
        ExecutorConfig {
            max_retries: 1,
            ..config()
        },
    );

    let report = executor.run(vec![0usize, 1]).await.unwrap();

    assert!(report.summary().is_success());
    for details in report.details() {
        assert_eq!(details.attempts(), 1);
        assert_eq!(details.rate_limited_attempts(), 1);
        assert!(details.exceptions().is_empty());
    }
    let controllers = report.controllers();
    assert!(controllers.rate_decreases >= 1);
    assert!(controllers.lowest_refill_rate < 100.0);
}

#[tokio::test(start_paused = true)]
async fn uncounted_rate_limits_are_capped() {
    let log = CallLog::new();
    let work = scripted(&log, no_delay, |_, _| Err(Failure::RateLimited));
    let executor = EvalExecutor::new(
        work,
        classify,
        ExecutorConfig {
            max_retries: 2,
            max_rate_limit_retries: 3,
            ..config()
        },
    );

    let report = executor.run(vec![0usize]).await.unwrap();

    let details = &report.details()[0];
    assert_eq!(details.status(), ExecutionStatus::Failed);
    assert_eq!(details.rate_limited_attempts(), 3);
    assert_eq!(details.attempts(), 2);
    assert_eq!(log.calls(0), 5);
    assert_eq!(report.controllers().rate_decreases, 5);
}

#[tokio::test(start_paused = true)]
async fn counted_rate_limits_spend_the_retry_budget() {
    let log = CallLog::new();
    let work = scripted(&log, no_delay, |_, _| Err(Failure::RateLimited));
    let executor = EvalExecutor::new(
        work,
        classify,
        ExecutorConfig {
            max_retries: 2,
            count_rate_limits_as_attempts: true,
            ..config()
        },
    );

    let report = executor.run(vec![0usize]).await.unwrap();

    let details = &report.details()[0];
    assert_eq!(details.status(), ExecutionStatus::Failed);
    assert_eq!(details.attempts(), 2);
    assert_eq!(details.rate_limited_attempts(), 0);
    assert_eq!(details.exceptions().len(), 2);
    assert_eq!(log.calls(0), 2);
}

#[tokio::test(start_paused = true)]
async fn fatal_failures_are_not_retried() {
    let log = CallLog::new();
    let work = scripted(&log, no_delay, |input, _| {
        if input == 1 {
            Err(Failure::Fatal(input))
        } else {
            Ok(input)
        }
    });
    let executor = EvalExecutor::new(work, classify, config());

    let report = executor.run(vec![0usize, 1, 2]).await.unwrap();

    assert_eq!(
        statuses(report.details()),
        vec![
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Completed
        ]
    );
    assert_eq!(report.details()[1].attempts(), 1);
    assert_eq!(log.calls(1), 1);
}

#[tokio::test(start_paused = true)]
async fn fail_fast_skips_tasks_that_have_not_started() {
    let log = CallLog::new();
    let work = scripted(&log, no_delay, |input, _| {
        if input == 3 {
            Err(Failure::Fatal(input))
        } else {
            Ok(input)
        }
    });
    let executor = EvalExecutor::new(
        work,
        classify,
        ExecutorConfig {
            fail_fast: true,
            ..serial_config()
        },
    );

    let report = executor.run(inputs(10)).await.unwrap();

    let mut expected = vec![ExecutionStatus::Completed; 3];
    expected.push(ExecutionStatus::Failed);
    expected.extend([ExecutionStatus::DidNotRun; 6]);
    assert_eq!(statuses(report.details()), expected);
    assert_eq!(log.total_calls(), 4);
    assert_eq!(report.summary().did_not_run, 6);
    assert!(
        report.details()[4..]
            .iter()
            .all(|details| details.attempts() == 0 && details.exceptions().is_empty())
    );
}

#[tokio::test(start_paused = true)]
async fn fixed_concurrency_bounds_in_flight_calls() {
    let log = CallLog::new();
    let work = scripted(&log, |_| Duration::from_millis(20), |input, _| Ok(input));
    let executor = EvalExecutor::new(
        work,
        classify,
        ExecutorConfig {
            initial_concurrency: 2,
            adaptive_concurrency: false,
            ..config()
        },
    );

    let report = executor.run(inputs(20)).await.unwrap();

    assert!(report.summary().is_success());
    assert_eq!(log.peak_in_flight(), 2);
    assert_eq!(report.controllers().peak_in_flight, 2);
    assert_eq!(report.controllers().concurrency_limit, 2);
}

#[tokio::test(start_paused = true)]
async fn repeated_runs_are_independent() {
    let log = CallLog::new();
    let work = scripted(&log, no_delay, |input, call| {
        if input % 2 == 0 && call % 2 == 1 {
            Err(Failure::Transient(input))
        } else {
            Ok(input + 1)
        }
    });
    let executor = EvalExecutor::new(work, classify, config());

    let first = executor.run(inputs(6)).await.unwrap();
    let second = executor.run(inputs(6)).await.unwrap();

    assert_eq!(first.details(), second.details());
    assert_eq!(first.summary(), second.summary());
    assert_eq!(log.total_calls(), 2 * 9);
}

#[tokio::test(start_paused = true)]
async fn slow_attempts_time_out() {
    let log = CallLog::new();
    let work = scripted(
        &log,
        |input| Duration::from_millis(if input == 1 { 500 } else { 10 }),
        |input, _| Ok(input),
    );
    let executor = EvalExecutor::new(
        work,
        classify,
        ExecutorConfig {
            max_retries: 2,
            per_attempt_timeout_ms: Some(100),
            ..config()
        },
    );

    let report = executor.run(vec![0usize, 1, 2]).await.unwrap();

    let slow = &report.details()[1];
    assert_eq!(slow.status(), ExecutionStatus::Failed);
    assert_eq!(slow.attempts(), 2);
    assert!(slow.exceptions().iter().all(AttemptError::is_timeout));
    assert_eq!(report.summary().completed, 2);
    assert!(report.controllers().concurrency_limit < 8);
}

#[tokio::test(start_paused = true)]
async fn cancelled_before_run_nothing_starts() {
    let log = CallLog::new();
    let executor = EvalExecutor::new(scripted(&log, no_delay, |i, _| Ok(i)), classify, config());
    executor.cancel_handle().cancel();

    let report = executor.run(inputs(4)).await.unwrap();

    assert_eq!(statuses(report.details()), vec![ExecutionStatus::DidNotRun; 4]);
    assert_eq!(log.total_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_admitting_new_tasks() {
    let log = CallLog::new();
    let executor = EvalExecutor::new(
        scripted(&log, no_delay, |i, _| Ok(i)),
        classify,
        serial_config(),
    );
    let handle = executor.cancel_handle();
    let executor = executor.with_observer(move |event: &TaskEvent| {
        if event.index == 1 && event.status == ExecutionStatus::Completed {
            handle.cancel();
        }
    });

    let report = executor.run(inputs(5)).await.unwrap();

    assert_eq!(
        statuses(report.details()),
        vec![
            ExecutionStatus::Completed,
            ExecutionStatus::Completed,
            ExecutionStatus::DidNotRun,
            ExecutionStatus::DidNotRun,
            ExecutionStatus::DidNotRun
        ]
    );
    assert_eq!(log.total_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_backoff_fails_the_started_task() {
    let log = CallLog::new();
    let executor = EvalExecutor::new(
        scripted(&log, no_delay, |input, _| Err(Failure::Transient(input))),
        classify,
        ExecutorConfig {
            max_retries: 5,
            backoff_factor_ms: 1_000,
            ..config()
        },
    );
    let handle = executor.cancel_handle();

    let (report, ()) = tokio::join!(executor.run(vec![0usize]), async move {
        sleep(Duration::from_millis(100)).await;
        handle.cancel();
    });

    let report = report.unwrap();
    let details = &report.details()[0];
    assert_eq!(details.status(), ExecutionStatus::Failed);
    assert_eq!(details.attempts(), 1);
    assert_eq!(log.calls(0), 1);
}

#[tokio::test]
async fn invalid_config_fails_before_any_task() {
    let log = CallLog::new();
    let executor = EvalExecutor::new(
        scripted(&log, no_delay, |i, _| Ok(i)),
        classify,
        ExecutorConfig {
            max_retries: 0,
            ..config()
        },
    );

    let result = executor.run(vec![0usize, 1]).await;

    assert!(matches!(
        result,
        Err(ExecutorError::Config {
            source: ConfigError::ZeroMaxRetries
        })
    ));
    assert_eq!(log.total_calls(), 0);
}

#[tokio::test]
async fn blocking_run_refuses_to_nest() {
    let log = CallLog::new();
    let executor = EvalExecutor::new(scripted(&log, no_delay, |i, _| Ok(i)), classify, config());

    assert!(matches!(
        executor.run_blocking(vec![0usize]),
        Err(ExecutorError::BlockingInsideScheduler)
    ));
    assert_eq!(log.total_calls(), 0);
}

#[tokio::test]
async fn selects_cooperative_inside_a_runtime() {
    assert!(scheduler_active());
    assert_eq!(select_executor().kind(), StrategyKind::Cooperative);
}

#[test]
fn selects_worker_pool_without_a_runtime() {
    assert!(!scheduler_active());
    assert_eq!(select_executor().kind(), StrategyKind::WorkerPool);
}

#[tokio::test(start_paused = true)]
async fn observer_sees_every_transition() {
    let events = Arc::new(Mutex::new(Vec::<TaskEvent>::new()));
    let log = CallLog::new();
    let executor = EvalExecutor::new(scripted(&log, no_delay, |i, _| Ok(i)), classify, config())
        .with_observer({
            let events = Arc::clone(&events);
            move |event: &TaskEvent| events.lock().push(*event)
        });

    executor.run(vec![0usize, 1, 2]).await.unwrap();

    let events = events.lock();
    assert_eq!(events.len(), 6);
    for index in 0..3 {
        let seen: Vec<_> = events
            .iter()
            .filter(|event| event.index == index)
            .map(|event| event.status)
            .collect();
        assert_eq!(
            seen,
            vec![ExecutionStatus::Running, ExecutionStatus::Completed]
        );
    }
    let last = events.last().unwrap();
    assert_eq!((last.finished, last.total), (3, 3));
}

#[tokio::test(start_paused = true)]
async fn successful_task_reports_completion() {
    let events = Arc::new(Mutex::new(Vec::<TaskEvent>::new()));
    let log = CallLog::new();
    let executor = EvalExecutor::new(scripted(&log, no_delay, |i, _| Ok(i)), classify, config())
        .with_observer({
            let events = Arc::clone(&events);
            move |event: &TaskEvent| events.lock().push(*event)
        });

    let report = executor.run(vec![7usize]).await.unwrap();

    assert_eq!(report.details()[0].status(), ExecutionStatus::Completed);
    assert_eq!(report.summary().completed, 1);
    assert_eq!(
        *events.lock(),
        vec![
            TaskEvent {
                index: 0,
                status: ExecutionStatus::Running,
                attempts: 0,
                finished: 0,
                total: 1,
            },
            TaskEvent {
                index: 0,
                status: ExecutionStatus::Completed,
                attempts: 1,
                finished: 1,
                total: 1,
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn tower_services_drive_a_run() {
    let service = tower::service_fn(|input: usize| async move {
        if input == 2 {
            Err(Failure::Fatal(input))
        } else {
            Ok(input + 100)
        }
    });
    let executor = EvalExecutor::new(ServiceWork::new(service), classify, config());

    let report = executor.run(vec![0usize, 1, 2]).await.unwrap();

    let results: Vec<_> = report.results().map(Result::ok).collect();
    assert_eq!(results, vec![Some(&100), Some(&101), None]);
}

#[test]
fn run_emits_task_metrics() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    let log = CallLog::new();
    let executor = EvalExecutor::new(
        scripted(&log, no_delay, |input, call| {
            if input == 0 && call == 1 {
                Err(Failure::Transient(input))
            } else {
                Ok(input)
            }
        }),
        classify,
        config(),
    );

    let report = metrics::with_local_recorder(&recorder, || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(executor.run(vec![0usize, 1, 2])).unwrap()
    });
    assert!(report.summary().is_success());

    let snapshot = snapshotter.snapshot().into_vec();
    let counter = |name: &str| {
        snapshot
            .iter()
            .find(|(key, ..)| key.key().name() == name)
            .map(|(.., value)| owned(value))
    };
    assert_eq!(
        counter("eval_executor_tasks_total"),
        Some(DebugValue::Counter(3))
    );
    assert_eq!(
        counter("eval_executor_retries_total"),
        Some(DebugValue::Counter(1))
    );
}

#[test]
fn worker_pool_preserves_input_order() {
    trace_init();
    let log = CallLog::new();
    let work = scripted(
        &log,
        |input| Duration::from_millis((20 - input) as u64),
        |input, _| Ok(input * 3),
    );
    let executor = EvalExecutor::new(
        work,
        classify,
        ExecutorConfig {
            workers: Some(4),
            ..config()
        },
    );

    let report = executor.run_blocking(inputs(20)).unwrap();

    assert_eq!(report.strategy(), StrategyKind::WorkerPool);
    let outputs: Vec<_> = report.into_results().into_iter().map(Result::ok).collect();
    assert_eq!(outputs, (0..20).map(|i| Some(i * 3)).collect::<Vec<_>>());
}

#[test]
fn worker_pool_retries_like_cooperative() {
    let log = CallLog::new();
    let work = scripted(&log, no_delay, |input, call| {
        if (input == 3 || input == 7) && call == 1 {
            Err(Failure::Transient(input))
        } else {
            Ok(input)
        }
    });
    let executor = EvalExecutor::new(
        work,
        classify,
        ExecutorConfig {
            max_retries: 2,
            workers: Some(3),
            ..config()
        },
    );

    let report = executor.run_blocking(inputs(10)).unwrap();

    assert!(report.summary().is_success());
    let attempts: Vec<_> = report.details().iter().map(ExecutionDetails::attempts).collect();
    assert_eq!(attempts, vec![1, 1, 1, 2, 1, 1, 1, 2, 1, 1]);
}

#[test]
fn worker_pool_fail_fast() {
    let log = CallLog::new();
    let work = scripted(&log, no_delay, |input, _| {
        if input == 3 {
            Err(Failure::Fatal(input))
        } else {
            Ok(input)
        }
    });
    let executor = EvalExecutor::new(
        work,
        classify,
        ExecutorConfig {
            fail_fast: true,
            ..serial_config()
        },
    );

    let report = executor.run_blocking(inputs(10)).unwrap();

    let summary = report.summary();
    assert_eq!(
        (summary.completed, summary.failed, summary.did_not_run),
        (3, 1, 6)
    );
    assert_eq!(report.details()[3].status(), ExecutionStatus::Failed);
    assert_eq!(log.total_calls(), 4);
}

#[test]
fn worker_pool_shares_the_concurrency_limit() {
    let log = CallLog::new();
    let work = scripted(&log, |_| Duration::from_millis(5), |input, _| Ok(input));
    let executor = EvalExecutor::new(
        work,
        classify,
        ExecutorConfig {
            initial_concurrency: 2,
            adaptive_concurrency: false,
            workers: Some(6),
            ..config()
        },
    );

    let report = executor.run_blocking(inputs(24)).unwrap();

    assert!(report.summary().is_success());
    assert!(log.peak_in_flight() <= 2);
    assert!(report.controllers().peak_in_flight <= 2);
}

#[test]
fn worker_pool_panic_loses_only_the_in_flight_task() {
    let log = CallLog::new();
    let work = scripted(&log, no_delay, |input, _| {
        if input == 2 {
            panic!("work for input {input} panicked");
        }
        Ok(input)
    });
    let executor = EvalExecutor::new(
        work,
        classify,
        ExecutorConfig {
            workers: Some(2),
            ..config()
        },
    );

    let report = executor.run_blocking(inputs(6)).unwrap();

    assert_eq!(
        statuses(report.details()),
        vec![
            ExecutionStatus::Completed,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Completed,
            ExecutionStatus::Completed,
            ExecutionStatus::Completed,
        ]
    );
    let outputs: Vec<_> = report.into_results().into_iter().map(Result::ok).collect();
    assert_eq!(outputs, vec![Some(0), Some(1), None, Some(3), Some(4), Some(5)]);
}
