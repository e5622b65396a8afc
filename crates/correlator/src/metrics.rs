use std::sync::atomic::{AtomicU64, Ordering};

use lazy_static::lazy_static;
use prometheus::{core::Collector, IntCounter, IntCounterVec, Registry};
use tracing::error;

use crate::model::BodySide;

#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct CorrelatorMetricsSnapshot {
    pub records: u64,
    pub plain_events: u64,
    pub plain_attaches: u64,
    pub decrypt_hits: u64,
    pub decrypt_misses: u64,
    pub bucket_trims: u64,
}

static RECORDS: AtomicU64 = AtomicU64::new(0);
static PLAIN_EVENTS: AtomicU64 = AtomicU64::new(0);
static PLAIN_ATTACHES: AtomicU64 = AtomicU64::new(0);
static DECRYPT_HITS: AtomicU64 = AtomicU64::new(0);
static DECRYPT_MISSES: AtomicU64 = AtomicU64::new(0);
static BUCKET_TRIMS: AtomicU64 = AtomicU64::new(0);

lazy_static! {
    static ref RECORDS_TOTAL: IntCounter = IntCounter::new(
        "cipherscope_records_total",
        "Protocol records accepted into the store"
    )
    .unwrap();
    static ref PLAIN_EVENTS_TOTAL: IntCounter = IntCounter::new(
        "cipherscope_plain_events_total",
        "Plaintext events drained from the page"
    )
    .unwrap();
    static ref ATTACHES_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new(
            "cipherscope_plain_attaches_total",
            "Plaintext bodies attached to records"
        ),
        &["side"]
    )
    .unwrap();
    static ref DECRYPT_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new(
            "cipherscope_decrypt_invocations_total",
            "Page-side decryption invocations by outcome"
        ),
        &["outcome"]
    )
    .unwrap();
    static ref BUCKET_TRIMS_TOTAL: IntCounter = IntCounter::new(
        "cipherscope_bucket_trims_total",
        "Pending bucket sequences trimmed under backpressure"
    )
    .unwrap();
}

fn register<C>(registry: &Registry, collector: C)
where
    C: Collector + Clone + Send + Sync + 'static,
{
    if let Err(err) = registry.register(Box::new(collector.clone())) {
        if !matches!(err, prometheus::Error::AlreadyReg) {
            error!(?err, "failed to register correlator metric");
        }
    }
}

pub fn register_metrics(registry: &Registry) {
    register(registry, RECORDS_TOTAL.clone());
    register(registry, PLAIN_EVENTS_TOTAL.clone());
    register(registry, ATTACHES_TOTAL.clone());
    register(registry, DECRYPT_TOTAL.clone());
    register(registry, BUCKET_TRIMS_TOTAL.clone());
}

pub fn record_protocol_record() {
    RECORDS.fetch_add(1, Ordering::Relaxed);
    RECORDS_TOTAL.inc();
}

pub fn record_plain_events(count: usize) {
    PLAIN_EVENTS.fetch_add(count as u64, Ordering::Relaxed);
    PLAIN_EVENTS_TOTAL.inc_by(count as u64);
}

pub fn record_attach(side: BodySide) {
    PLAIN_ATTACHES.fetch_add(1, Ordering::Relaxed);
    let label = match side {
        BodySide::Request => "request",
        BodySide::Response => "response",
    };
    ATTACHES_TOTAL.with_label_values(&[label]).inc();
}

pub fn record_decrypt(hit: bool) {
    if hit {
        DECRYPT_HITS.fetch_add(1, Ordering::Relaxed);
        DECRYPT_TOTAL.with_label_values(&["hit"]).inc();
    } else {
        DECRYPT_MISSES.fetch_add(1, Ordering::Relaxed);
        DECRYPT_TOTAL.with_label_values(&["miss"]).inc();
    }
}

pub fn record_bucket_trim() {
    BUCKET_TRIMS.fetch_add(1, Ordering::Relaxed);
    BUCKET_TRIMS_TOTAL.inc();
}

pub fn snapshot() -> CorrelatorMetricsSnapshot {
    CorrelatorMetricsSnapshot {
        records: RECORDS.load(Ordering::Relaxed),
        plain_events: PLAIN_EVENTS.load(Ordering::Relaxed),
        plain_attaches: PLAIN_ATTACHES.load(Ordering::Relaxed),
        decrypt_hits: DECRYPT_HITS.load(Ordering::Relaxed),
        decrypt_misses: DECRYPT_MISSES.load(Ordering::Relaxed),
        bucket_trims: BUCKET_TRIMS.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_only_grow() {
        let before = snapshot();
        record_plain_events(3);
        record_attach(BodySide::Request);
        record_decrypt(false);
        let after = snapshot();
        assert!(after.plain_events >= before.plain_events + 3);
        assert!(after.plain_attaches > before.plain_attaches);
        assert!(after.decrypt_misses > before.decrypt_misses);
    }
}
