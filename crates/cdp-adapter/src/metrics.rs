//! Counters for the CDP record source: command traffic, assembled transactions, body
//! retrieval and page evaluations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use cipherscope_correlator::BodySide;
use lazy_static::lazy_static;
use prometheus::{
    core::Collector, histogram_opts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
};
use tracing::error;

/// How an in-flight transaction left the assembler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionOutcome {
    Finished,
    Failed,
    /// Dropped unfinished to keep the in-flight table bounded.
    Evicted,
}

impl TransactionOutcome {
    fn label(self) -> &'static str {
        match self {
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Evicted => "evicted",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyFetch {
    Captured,
    Empty,
    Unavailable,
}

impl BodyFetch {
    fn label(self) -> &'static str {
        match self {
            Self::Captured => "captured",
            Self::Empty => "empty",
            Self::Unavailable => "unavailable",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvaluationOutcome {
    Value,
    Exception,
    Unavailable,
}

impl EvaluationOutcome {
    fn label(self) -> &'static str {
        match self {
            Self::Value => "value",
            Self::Exception => "exception",
            Self::Unavailable => "unavailable",
        }
    }
}

fn side_label(side: BodySide) -> &'static str {
    match side {
        BodySide::Request => "request",
        BodySide::Response => "response",
    }
}

/// Totals printed in the session summary.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdapterMetricsSnapshot {
    pub commands: u64,
    pub command_failures: u64,
    pub events: u64,
    pub transactions_finished: u64,
    pub transactions_failed: u64,
    pub transactions_evicted: u64,
    pub bodies_captured: u64,
    pub bodies_unavailable: u64,
    pub evaluation_exceptions: u64,
}

struct Totals {
    commands: AtomicU64,
    command_failures: AtomicU64,
    events: AtomicU64,
    finished: AtomicU64,
    failed: AtomicU64,
    evicted: AtomicU64,
    bodies_captured: AtomicU64,
    bodies_unavailable: AtomicU64,
    evaluation_exceptions: AtomicU64,
}

static TOTALS: Totals = Totals {
    commands: AtomicU64::new(0),
    command_failures: AtomicU64::new(0),
    events: AtomicU64::new(0),
    finished: AtomicU64::new(0),
    failed: AtomicU64::new(0),
    evicted: AtomicU64::new(0),
    bodies_captured: AtomicU64::new(0),
    bodies_unavailable: AtomicU64::new(0),
    evaluation_exceptions: AtomicU64::new(0),
};

lazy_static! {
    static ref COMMANDS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("cipherscope_cdp_commands_total", "CDP commands by method and outcome"),
        &["method", "outcome"]
    )
    .unwrap();
    static ref COMMAND_DURATION: HistogramVec = HistogramVec::new(
        histogram_opts!(
            "cipherscope_cdp_command_duration_seconds",
            "CDP command round-trip time",
            vec![0.005, 0.02, 0.1, 0.5, 2.0, 10.0]
        ),
        &["method"]
    )
    .unwrap();
    static ref EVENTS_TOTAL: IntCounter =
        IntCounter::new("cipherscope_cdp_events_total", "CDP events received").unwrap();
    static ref TRANSACTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "cipherscope_cdp_transactions_total",
            "Network transactions leaving the assembler, by outcome"
        ),
        &["outcome"]
    )
    .unwrap();
    static ref BODY_FETCHES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "cipherscope_cdp_body_fetches_total",
            "Request/response body retrievals by side and outcome"
        ),
        &["side", "outcome"]
    )
    .unwrap();
    static ref EVALUATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "cipherscope_cdp_evaluations_total",
            "Runtime.evaluate calls made for the page agent, by outcome"
        ),
        &["outcome"]
    )
    .unwrap();
}

fn register<C>(registry: &Registry, collector: C)
where
    C: Collector + Clone + Send + Sync + 'static,
{
    if let Err(err) = registry.register(Box::new(collector.clone())) {
        if !matches!(err, prometheus::Error::AlreadyReg) {
            error!(?err, "failed to register cdp metric");
        }
    }
}

pub fn register_metrics(registry: &Registry) {
    register(registry, COMMANDS_TOTAL.clone());
    register(registry, COMMAND_DURATION.clone());
    register(registry, EVENTS_TOTAL.clone());
    register(registry, TRANSACTIONS_TOTAL.clone());
    register(registry, BODY_FETCHES_TOTAL.clone());
    register(registry, EVALUATIONS_TOTAL.clone());
}

pub fn record_command(method: &str, elapsed: Duration, ok: bool) {
    TOTALS.commands.fetch_add(1, Ordering::Relaxed);
    if !ok {
        TOTALS.command_failures.fetch_add(1, Ordering::Relaxed);
    }
    let outcome = if ok { "ok" } else { "error" };
    COMMANDS_TOTAL.with_label_values(&[method, outcome]).inc();
    COMMAND_DURATION
        .with_label_values(&[method])
        .observe(elapsed.as_secs_f64());
}

pub fn record_event() {
    TOTALS.events.fetch_add(1, Ordering::Relaxed);
    EVENTS_TOTAL.inc();
}

pub fn record_transaction(outcome: TransactionOutcome) {
    let total = match outcome {
        TransactionOutcome::Finished => &TOTALS.finished,
        TransactionOutcome::Failed => &TOTALS.failed,
        TransactionOutcome::Evicted => &TOTALS.evicted,
    };
    total.fetch_add(1, Ordering::Relaxed);
    TRANSACTIONS_TOTAL.with_label_values(&[outcome.label()]).inc();
}

pub fn record_body_fetch(side: BodySide, outcome: BodyFetch) {
    match outcome {
        BodyFetch::Captured => TOTALS.bodies_captured.fetch_add(1, Ordering::Relaxed),
        BodyFetch::Unavailable => TOTALS.bodies_unavailable.fetch_add(1, Ordering::Relaxed),
        BodyFetch::Empty => 0,
    };
    BODY_FETCHES_TOTAL
        .with_label_values(&[side_label(side), outcome.label()])
        .inc();
}

pub fn record_evaluation(outcome: EvaluationOutcome) {
    if outcome == EvaluationOutcome::Exception {
        TOTALS.evaluation_exceptions.fetch_add(1, Ordering::Relaxed);
    }
    EVALUATIONS_TOTAL.with_label_values(&[outcome.label()]).inc();
}

pub fn snapshot() -> AdapterMetricsSnapshot {
    let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
    AdapterMetricsSnapshot {
        commands: load(&TOTALS.commands),
        command_failures: load(&TOTALS.command_failures),
        events: load(&TOTALS.events),
        transactions_finished: load(&TOTALS.finished),
        transactions_failed: load(&TOTALS.failed),
        transactions_evicted: load(&TOTALS.evicted),
        bodies_captured: load(&TOTALS.bodies_captured),
        bodies_unavailable: load(&TOTALS.bodies_unavailable),
        evaluation_exceptions: load(&TOTALS.evaluation_exceptions),
    }
}
