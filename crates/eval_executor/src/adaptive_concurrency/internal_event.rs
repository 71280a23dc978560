//! Metric events emitted by the controllers and the executor.
//!
//! Each event is a plain struct; `emit` records it through the `metrics` facade and
//! mirrors it to `tracing` at a level matching how chatty the event is.

use metrics::{counter, gauge, histogram};

use crate::execution::ExecutionStatus;

pub trait InternalEvent: Sized {
    fn emit(self);
}

#[derive(Clone, Copy, Debug)]
pub struct RateLimitAdjusted {
    pub refill_rate: f64,
    pub decreased: bool,
}

impl InternalEvent for RateLimitAdjusted {
    fn emit(self) {
        gauge!("eval_executor_refill_rate").set(self.refill_rate);
        tracing::debug!(
            target: "eval_executor::stats",
            refill_rate = self.refill_rate,
            decreased = self.decreased,
            "Refill rate adjusted"
        );
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ConcurrencyLimitAdjusted {
    pub limit: u64,
}

impl InternalEvent for ConcurrencyLimitAdjusted {
    fn emit(self) {
        // A histogram, as the limit may take several values per reporting interval and
        // each of them is valuable for diagnosis.
        histogram!("eval_executor_concurrency_limit").record(self.limit as f64);
        tracing::debug!(
            target: "eval_executor::stats",
            concurrency_limit = self.limit,
            "Limit adjusted"
        );
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SlotsInFlight {
    pub in_flight: u64,
}

impl InternalEvent for SlotsInFlight {
    fn emit(self) {
        histogram!("eval_executor_in_flight").record(self.in_flight as f64);
        tracing::trace!(target: "eval_executor::stats", in_flight = self.in_flight, "In-flight updated");
    }
}

#[derive(Clone, Copy, Debug)]
pub struct AttemptRetried {
    pub reason: &'static str,
}

impl InternalEvent for AttemptRetried {
    fn emit(self) {
        counter!("eval_executor_retries_total", "reason" => self.reason).increment(1);
    }
}

#[derive(Clone, Copy, Debug)]
pub struct TaskFinished {
    pub status: ExecutionStatus,
}

impl InternalEvent for TaskFinished {
    fn emit(self) {
        counter!("eval_executor_tasks_total", "status" => self.status.as_str()).increment(1);
    }
}
