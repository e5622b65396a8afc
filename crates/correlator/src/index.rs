//! Pending buckets of drained plaintext events and the attach algorithm.
//!
//! Every event is filed under two keys, `METHOD full-url` and `METHOD path?query`, so a record
//! whose wire URL differs from the page-level URL only in origin still finds its events. Both
//! key spaces are tried in that order; the first bucket that yields a usable event wins.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;
use url::Url;

use crate::config::CaptureConfig;
use crate::metrics;
use crate::model::{BodySide, EventPhase, PlainEvent, ProtocolRecord};

/// Insertion-ordered request/response events for one key.
#[derive(Debug, Default)]
pub struct PendingBucket {
    reqs: Vec<Arc<PlainEvent>>,
    ress: Vec<Arc<PlainEvent>>,
}

impl PendingBucket {
    pub fn reqs(&self) -> &[Arc<PlainEvent>] {
        &self.reqs
    }

    pub fn ress(&self) -> &[Arc<PlainEvent>] {
        &self.ress
    }

    /// Event whose send time is nearest to `started_at`; the oldest event without a start time.
    /// Ties resolve to the earlier-appended event.
    fn request_candidate(&self, started_at: Option<f64>) -> Option<&Arc<PlainEvent>> {
        match started_at {
            Some(start) => self
                .reqs
                .iter()
                .min_by(|a, b| (a.ts - start).abs().total_cmp(&(b.ts - start).abs())),
            None => self.reqs.first(),
        }
    }

    fn response_candidate(&self) -> Option<&Arc<PlainEvent>> {
        self.ress.first()
    }
}

#[derive(Debug)]
pub struct CorrelationIndex {
    buckets: HashMap<String, PendingBucket>,
    high_water: usize,
    retain: usize,
}

impl CorrelationIndex {
    pub fn new(high_water: usize, retain: usize) -> Self {
        Self {
            buckets: HashMap::new(),
            high_water: high_water.max(1),
            retain: retain.min(high_water),
        }
    }

    pub fn from_config(config: &CaptureConfig) -> Self {
        Self::new(config.bucket_high_water, config.bucket_retain)
    }

    pub fn bucket(&self, key: &str) -> Option<&PendingBucket> {
        self.buckets.get(key)
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }

    /// File drained events under both of their keys, in drain order.
    pub fn ingest(&mut self, events: Vec<PlainEvent>) {
        for event in events {
            let keys = lookup_keys(&event.method, &event.url, event.path.as_deref());
            let event = Arc::new(event);
            for key in keys {
                let bucket = self.buckets.entry(key).or_default();
                let seq = match event.phase {
                    EventPhase::Request => &mut bucket.reqs,
                    EventPhase::Response => &mut bucket.ress,
                };
                if push_capped(seq, Arc::clone(&event), self.high_water, self.retain) {
                    metrics::record_bucket_trim();
                }
            }
        }
    }

    /// Attach plaintext bodies to whichever of the record's sides are still empty.
    ///
    /// Chosen events stay in their bucket; only trimming retires events.
    pub fn attach(&self, record: &mut ProtocolRecord) -> Vec<BodySide> {
        let keys = lookup_keys(&record.request.method, &record.request.url, None);
        let mut attached = Vec::new();

        if !record.has_plain(BodySide::Request) {
            let started_at = record.started_at;
            let found = keys.iter().find_map(|key| {
                let event = self.buckets.get(key)?.request_candidate(started_at)?;
                event.body.clone().filter(|body| !body.is_null())
            });
            if let Some(body) = found {
                if record.attach_plain(BodySide::Request, body) {
                    attached.push(BodySide::Request);
                }
            }
        }

        if !record.has_plain(BodySide::Response) {
            let found = keys.iter().find_map(|key| {
                let event = self.buckets.get(key)?.response_candidate()?;
                event.body.clone().filter(|body| !body.is_null())
            });
            if let Some(body) = found {
                if record.attach_plain(BodySide::Response, body) {
                    attached.push(BodySide::Response);
                }
            }
        }

        for side in &attached {
            metrics::record_attach(*side);
            trace!(target: "correlator", record = %record.id, ?side, "plaintext attached");
        }
        attached
    }
}

fn push_capped(
    seq: &mut Vec<Arc<PlainEvent>>,
    event: Arc<PlainEvent>,
    high_water: usize,
    retain: usize,
) -> bool {
    seq.push(event);
    if seq.len() > high_water {
        let excess = seq.len() - retain;
        seq.drain(..excess);
        true
    } else {
        false
    }
}

pub fn url_key(method: &str, url: &str) -> String {
    format!("{} {}", method.to_ascii_uppercase(), url)
}

/// Origin-stripped `path?query` form of a URL. Already-relative paths pass through.
pub fn origin_stripped(url: &str) -> Option<String> {
    match Url::parse(url) {
        Ok(parsed) => {
            let mut path = parsed.path().to_string();
            if let Some(query) = parsed.query() {
                path.push('?');
                path.push_str(query);
            }
            Some(path)
        }
        Err(_) if url.starts_with('/') => Some(url.to_string()),
        Err(_) => None,
    }
}

/// Full-URL key first, then the path key when it differs.
pub fn lookup_keys(method: &str, url: &str, path: Option<&str>) -> Vec<String> {
    let mut keys = vec![url_key(method, url)];
    let path = path.map(str::to_string).or_else(|| origin_stripped(url));
    if let Some(path) = path {
        let key = url_key(method, &path);
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys
}
