//! Helpers shared by the unit tests.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use crate::adaptive_concurrency::retries::FailureKind;

/// Installs a test subscriber honouring `RUST_LOG`. Safe to call from every test.
pub fn trace_init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Error produced by scripted work.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Failure {
    RateLimited,
    Transient(usize),
    Fatal(usize),
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::RateLimited => f.write_str("429 too many requests"),
            Failure::Transient(index) => write!(f, "transient failure for input {index}"),
            Failure::Fatal(index) => write!(f, "fatal failure for input {index}"),
        }
    }
}

pub fn classify(failure: &Failure) -> FailureKind {
    match failure {
        Failure::RateLimited => FailureKind::RateLimited,
        Failure::Transient(_) => FailureKind::Transient,
        Failure::Fatal(_) => FailureKind::Fatal,
    }
}

/// Counts calls per input and tracks how many calls overlap.
#[derive(Clone, Debug, Default)]
pub struct CallLog {
    calls: Arc<Mutex<HashMap<usize, usize>>>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the start of a call and returns its 1-based call number for `input`.
    pub fn enter(&self, input: usize) -> usize {
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
        let mut calls = self.calls.lock();
        let count = calls.entry(input).or_default();
        *count += 1;
        *count
    }

    pub fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn calls(&self, input: usize) -> usize {
        self.calls.lock().get(&input).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }
}

/// Work that sleeps `delay(input)`, then answers according to `script(input, call)`,
/// where `call` is the 1-based call number for that input.
pub fn scripted<D, S>(
    log: &CallLog,
    delay: D,
    script: S,
) -> impl Fn(usize) -> Pin<Box<dyn Future<Output = Result<usize, Failure>> + Send>>
+ Send
+ Sync
+ 'static
where
    D: Fn(usize) -> Duration + Send + Sync + 'static,
    S: Fn(usize, usize) -> Result<usize, Failure> + Send + Sync + 'static,
{
    let log = log.clone();
    let delay = Arc::new(delay);
    let script = Arc::new(script);
    move |input: usize| {
        let log = log.clone();
        let delay = Arc::clone(&delay);
        let script = Arc::clone(&script);
        Box::pin(async move {
            let call = log.enter(input);
            tokio::time::sleep(delay(input)).await;
            log.exit();
            script(input, call)
        })
    }
}
