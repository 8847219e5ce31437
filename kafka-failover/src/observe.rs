use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

use crate::ledger::LedgerSummary;

pub const METRIC_ITERATIONS: &str = "iterations";
pub const METRIC_ITERATIONS_DELAYED: &str = "iterations_delayed";
pub const METRIC_ACKS_MISSED: &str = "acks_missed_timeout";
pub const METRIC_POLL_ERRORS: &str = "consumer_poll_errors";
pub const METRIC_ITERATION_LATENCY: &str = "iteration_latency_seconds";
pub const METRIC_MESSAGES_LOST: &str = "run_messages_lost";
pub const METRIC_MESSAGES_DUPLICATED: &str = "run_messages_duplicated";
pub const METRIC_DUPLICATE_ACKS: &str = "run_duplicate_acks";
pub const METRIC_MESSAGES_UNMATCHED: &str = "run_messages_unmatched";
pub const METRIC_MESSAGES_REORDERED: &str = "run_messages_reordered";

/// Receives the timing and anomaly observations made by a run.
/// Every observation only ever adds, nothing is reset.
pub trait RunObserver: Send + Sync {
    fn iteration_started(&self);
    fn iteration_delayed(&self);
    fn ack_missed(&self);
    fn poll_error(&self);
    /// Time taken by one iteration, excluding the cadence wait.
    fn iteration_latency(&self, latency: Duration);
    fn summary(&self, summary: &LedgerSummary);
}

/// Register all metrics with descriptions
pub fn register_metrics() {
    describe_counter!(METRIC_ITERATIONS, "Test loop iterations started so far");
    describe_counter!(
        METRIC_ITERATIONS_DELAYED,
        "Test loop iterations that failed to complete within the configured interval"
    );
    describe_counter!(
        METRIC_ACKS_MISSED,
        "Produce calls that failed to get an ack within the configured timeout"
    );
    describe_counter!(METRIC_POLL_ERRORS, "Consumer polls that returned an error");
    describe_histogram!(
        METRIC_ITERATION_LATENCY,
        "Time taken for each test loop, excluding initial wait"
    );
    describe_gauge!(
        METRIC_MESSAGES_LOST,
        "Messages acked but never consumed in the last completed run"
    );
    describe_gauge!(
        METRIC_MESSAGES_DUPLICATED,
        "Extra deliveries of already consumed messages in the last completed run"
    );
    describe_gauge!(
        METRIC_DUPLICATE_ACKS,
        "Messages acked more than once in the last completed run"
    );
    describe_gauge!(
        METRIC_MESSAGES_UNMATCHED,
        "Consumed messages without a produced counterpart in the last completed run"
    );
    describe_gauge!(
        METRIC_MESSAGES_REORDERED,
        "Messages consumed out of order within their partition in the last completed run"
    );
}

/// Reports to the process-wide `metrics` recorder, aggregating across runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusObserver;

impl RunObserver for PrometheusObserver {
    fn iteration_started(&self) {
        counter!(METRIC_ITERATIONS).increment(1);
    }

    fn iteration_delayed(&self) {
        counter!(METRIC_ITERATIONS_DELAYED).increment(1);
    }

    fn ack_missed(&self) {
        counter!(METRIC_ACKS_MISSED).increment(1);
    }

    fn poll_error(&self) {
        counter!(METRIC_POLL_ERRORS).increment(1);
    }

    fn iteration_latency(&self, latency: Duration) {
        histogram!(METRIC_ITERATION_LATENCY).record(latency.as_secs_f64());
    }

    fn summary(&self, summary: &LedgerSummary) {
        gauge!(METRIC_MESSAGES_LOST).set(summary.lost as f64);
        gauge!(METRIC_MESSAGES_DUPLICATED).set(summary.duplicates as f64);
        gauge!(METRIC_DUPLICATE_ACKS).set(summary.duplicate_acks as f64);
        gauge!(METRIC_MESSAGES_UNMATCHED).set(summary.unmatched as f64);
        gauge!(METRIC_MESSAGES_REORDERED).set(summary.reordered as f64);
    }
}

/// Keeps observations in memory, scoped to the runs it is handed to.
#[derive(Debug, Default)]
pub struct CountingObserver {
    iterations: AtomicU64,
    delayed: AtomicU64,
    acks_missed: AtomicU64,
    poll_errors: AtomicU64,
    latencies: Mutex<Vec<Duration>>,
    summary: Mutex<Option<LedgerSummary>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Counts {
    pub iterations: u64,
    pub delayed: u64,
    pub acks_missed: u64,
    pub poll_errors: u64,
}

impl CountingObserver {
    pub fn counts(&self) -> Counts {
        Counts {
            iterations: self.iterations.load(Ordering::SeqCst),
            delayed: self.delayed.load(Ordering::SeqCst),
            acks_missed: self.acks_missed.load(Ordering::SeqCst),
            poll_errors: self.poll_errors.load(Ordering::SeqCst),
        }
    }

    pub fn latencies(&self) -> Vec<Duration> {
        self.latencies
            .lock()
            .map(|latencies| latencies.clone())
            .unwrap_or_default()
    }

    pub fn last_summary(&self) -> Option<LedgerSummary> {
        self.summary.lock().ok().and_then(|summary| summary.clone())
    }
}

impl RunObserver for CountingObserver {
    fn iteration_started(&self) {
        self.iterations.fetch_add(1, Ordering::SeqCst);
    }

    fn iteration_delayed(&self) {
        self.delayed.fetch_add(1, Ordering::SeqCst);
    }

    fn ack_missed(&self) {
        self.acks_missed.fetch_add(1, Ordering::SeqCst);
    }

    fn poll_error(&self) {
        self.poll_errors.fetch_add(1, Ordering::SeqCst);
    }

    fn iteration_latency(&self, latency: Duration) {
        if let Ok(mut latencies) = self.latencies.lock() {
            latencies.push(latency);
        }
    }

    fn summary(&self, summary: &LedgerSummary) {
        if let Ok(mut last) = self.summary.lock() {
            *last = Some(summary.clone());
        }
    }
}
