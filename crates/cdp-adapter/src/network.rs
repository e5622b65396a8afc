//! Assembles `Network.*` events of one page session into finished protocol records.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cipherscope_correlator::model::{decode_body, Headers};
use cipherscope_correlator::{BodySide, ProtocolRecord};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::AdapterError;
use crate::metrics::{self, BodyFetch, TransactionOutcome};
use crate::transport::{CdpTransport, CommandTarget, TransportEvent};

/// Transactions that never finish are bounded by this many entries.
pub const MAX_INFLIGHT: usize = 2048;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest {
    url: String,
    method: String,
    #[serde(default)]
    headers: Map<String, Value>,
    #[serde(default)]
    post_data: Option<String>,
    #[serde(default)]
    has_post_data: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    status: i64,
    #[serde(default)]
    status_text: String,
    #[serde(default)]
    headers: Map<String, Value>,
    #[serde(default)]
    headers_text: Option<String>,
    #[serde(default)]
    request_headers: Option<Map<String, Value>>,
    #[serde(default)]
    request_headers_text: Option<String>,
    #[serde(default)]
    timing: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Initiator {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestWillBeSent {
    request_id: String,
    request: WireRequest,
    timestamp: f64,
    #[serde(default)]
    wall_time: Option<f64>,
    #[serde(default)]
    initiator: Option<Initiator>,
    #[serde(default)]
    redirect_response: Option<WireResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseReceived {
    request_id: String,
    response: WireResponse,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadingFinished {
    request_id: String,
    timestamp: f64,
    #[serde(default)]
    encoded_data_length: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadingFailed {
    request_id: String,
    timestamp: f64,
    #[serde(default)]
    error_text: String,
}

struct Inflight {
    seq: u64,
    record: ProtocolRecord,
    started: f64,
    post_data: Option<String>,
    has_post_data: bool,
}

pub struct NetworkAssembler {
    transport: Arc<dyn CdpTransport>,
    session_id: String,
    capture_bodies: Arc<AtomicBool>,
    inflight: HashMap<String, Inflight>,
    next_seq: u64,
    records: mpsc::Sender<ProtocolRecord>,
}

impl NetworkAssembler {
    pub fn new(
        transport: Arc<dyn CdpTransport>,
        session_id: impl Into<String>,
        records: mpsc::Sender<ProtocolRecord>,
        capture_bodies: bool,
    ) -> Self {
        Self {
            transport,
            session_id: session_id.into(),
            capture_bodies: Arc::new(AtomicBool::new(capture_bodies)),
            inflight: HashMap::new(),
            next_seq: 0,
            records,
        }
    }

    /// Shared switch for body capture; flipping it affects transactions finishing afterwards.
    pub fn capture_bodies(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.capture_bodies)
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    /// Feed one transport event. Returns false once our page session has been detached.
    pub fn handle_event(&mut self, event: TransportEvent) -> bool {
        if event.method == "Target.detachedFromTarget" {
            let ours = event.params.get("sessionId").and_then(Value::as_str)
                == Some(self.session_id.as_str());
            if ours {
                warn!(target: "cdp-adapter", session = %self.session_id, "page session detached");
            }
            return !ours;
        }
        if event.session_id.as_deref() != Some(self.session_id.as_str()) {
            return true;
        }

        let outcome = match event.method.as_str() {
            "Network.requestWillBeSent" => parse(event.params).map(|p| self.on_request(p)),
            "Network.responseReceived" => parse(event.params).map(|p| self.on_response(p)),
            "Network.loadingFinished" => parse(event.params).map(|p| self.on_finished(p)),
            "Network.loadingFailed" => parse(event.params).map(|p| self.on_failed(p)),
            _ => Ok(()),
        };
        if let Err(err) = outcome {
            debug!(target: "cdp-adapter", method = %event.method, %err, "skipping malformed network event");
        }
        true
    }

    fn on_request(&mut self, params: RequestWillBeSent) {
        if let Some(redirect) = params.redirect_response {
            if let Some(mut hop) = self.inflight.remove(&params.request_id) {
                apply_response(&mut hop.record, redirect);
                metrics::record_transaction(TransactionOutcome::Finished);
                self.complete(params.request_id.clone(), hop, params.timestamp, false);
            }
        }

        let mut record = ProtocolRecord::new(params.request.method, params.request.url);
        record.request.headers = flatten_headers(params.request.headers);
        record.initiator_type = params.initiator.map(|initiator| initiator.kind);
        record.started_at = params.wall_time.map(|secs| secs * 1000.0);

        if self.inflight.len() >= MAX_INFLIGHT {
            self.evict_oldest();
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.inflight.insert(
            params.request_id,
            Inflight {
                seq,
                record,
                started: params.timestamp,
                post_data: params.request.post_data,
                has_post_data: params.request.has_post_data.unwrap_or(false),
            },
        );
    }

    fn on_response(&mut self, params: ResponseReceived) {
        if let Some(entry) = self.inflight.get_mut(&params.request_id) {
            apply_response(&mut entry.record, params.response);
        }
    }

    fn on_finished(&mut self, params: LoadingFinished) {
        let Some(mut entry) = self.inflight.remove(&params.request_id) else {
            return;
        };
        entry.record.encoded_data_length = params
            .encoded_data_length
            .map(|len| len.max(0.0) as u64);
        metrics::record_transaction(TransactionOutcome::Finished);
        self.complete(params.request_id, entry, params.timestamp, true);
    }

    fn on_failed(&mut self, params: LoadingFailed) {
        let Some(mut entry) = self.inflight.remove(&params.request_id) else {
            return;
        };
        entry.record.response.status = 0;
        entry.record.response.status_text = params.error_text;
        metrics::record_transaction(TransactionOutcome::Failed);
        self.complete(params.request_id, entry, params.timestamp, false);
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .inflight
            .iter()
            .min_by_key(|(_, entry)| entry.seq)
            .map(|(id, _)| id.clone());
        if let Some(id) = oldest {
            self.inflight.remove(&id);
            metrics::record_transaction(TransactionOutcome::Evicted);
            debug!(target: "cdp-adapter", request_id = %id, "evicted unfinished transaction");
        }
    }

    fn complete(&self, request_id: String, entry: Inflight, finished: f64, with_bodies: bool) {
        let Inflight {
            mut record,
            started,
            post_data,
            has_post_data,
            ..
        } = entry;
        record.duration_ms = Some(((finished - started) * 1000.0).max(0.0));

        let tx = self.records.clone();
        if with_bodies && self.capture_bodies.load(Ordering::Relaxed) {
            let transport = Arc::clone(&self.transport);
            let session = self.session_id.clone();
            tokio::spawn(async move {
                record.request.body = settle(
                    BodySide::Request,
                    request_body(transport.as_ref(), &session, &request_id, post_data, has_post_data)
                        .await,
                );
                record.response.body = settle(
                    BodySide::Response,
                    response_body(transport.as_ref(), &session, &request_id).await,
                );
                if tx.send(record).await.is_err() {
                    debug!(target: "cdp-adapter", "record receiver dropped");
                }
            });
            return;
        }

        match tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                tokio::spawn(async move {
                    let _ = tx.send(record).await;
                });
            }
            Err(TrySendError::Closed(_)) => {
                debug!(target: "cdp-adapter", "record receiver dropped");
            }
        }
    }
}

fn parse<T: for<'de> Deserialize<'de>>(params: Value) -> serde_json::Result<T> {
    serde_json::from_value(params)
}

fn flatten_headers(raw: Map<String, Value>) -> Headers {
    raw.into_iter()
        .map(|(name, value)| {
            let value = match value {
                Value::String(text) => text,
                other => other.to_string(),
            };
            (name, value)
        })
        .collect()
}

fn apply_response(record: &mut ProtocolRecord, response: WireResponse) {
    record.response.status = response.status;
    record.response.status_text = response.status_text;
    record.response.headers = flatten_headers(response.headers);
    record.response.headers_text = response.headers_text;
    record.timing = response.timing;
    if let Some(sent) = response.request_headers.filter(|headers| !headers.is_empty()) {
        record.request.headers = flatten_headers(sent);
    }
    if response.request_headers_text.is_some() {
        record.request.headers_text = response.request_headers_text;
    }
}

async fn request_body(
    transport: &dyn CdpTransport,
    session: &str,
    request_id: &str,
    inline: Option<String>,
    has_post_data: bool,
) -> Result<Option<Value>, AdapterError> {
    if let Some(text) = inline {
        return Ok(decode_body(&text, false));
    }
    if !has_post_data {
        return Ok(None);
    }
    let reply = fetch(transport, session, "Network.getRequestPostData", request_id).await?;
    Ok(reply
        .get("postData")
        .and_then(Value::as_str)
        .and_then(|text| decode_body(text, false)))
}

async fn response_body(
    transport: &dyn CdpTransport,
    session: &str,
    request_id: &str,
) -> Result<Option<Value>, AdapterError> {
    let reply = fetch(transport, session, "Network.getResponseBody", request_id).await?;
    let base64 = reply
        .get("base64Encoded")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    Ok(reply
        .get("body")
        .and_then(Value::as_str)
        .and_then(|text| decode_body(text, base64)))
}

async fn fetch(
    transport: &dyn CdpTransport,
    session: &str,
    method: &str,
    request_id: &str,
) -> Result<Value, AdapterError> {
    transport
        .send_command(
            CommandTarget::Session(session.to_string()),
            method,
            json!({ "requestId": request_id }),
        )
        .await
}

/// Body capture is best-effort: a failed retrieval leaves the body absent.
fn settle(side: BodySide, fetched: Result<Option<Value>, AdapterError>) -> Option<Value> {
    match fetched {
        Ok(Some(body)) => {
            metrics::record_body_fetch(side, BodyFetch::Captured);
            Some(body)
        }
        Ok(None) => {
            metrics::record_body_fetch(side, BodyFetch::Empty);
            None
        }
        Err(err) => {
            debug!(target: "cdp-adapter", ?side, %err, "body unavailable");
            metrics::record_body_fetch(side, BodyFetch::Unavailable);
            None
        }
    }
}

/// Drive the assembler from the transport's event stream until cancelled or detached.
pub async fn pump_events(mut assembler: NetworkAssembler, cancel: CancellationToken) {
    let transport = Arc::clone(&assembler.transport);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = transport.next_event() => match event {
                Some(event) => {
                    if !assembler.handle_event(event) {
                        break;
                    }
                }
                None => {
                    info!(target: "cdp-adapter", "cdp event stream ended");
                    break;
                }
            },
        }
    }
    debug!(
        target: "cdp-adapter",
        unfinished = assembler.inflight_len(),
        "network assembler stopped"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::time::timeout;

    use crate::error::{AdapterError, AdapterErrorKind};

    struct MockTransport {
        bodies: HashMap<String, Value>,
        post_data: HashMap<String, Value>,
        events: tokio::sync::Mutex<mpsc::Receiver<TransportEvent>>,
    }

    impl MockTransport {
        fn new() -> (Self, mpsc::Sender<TransportEvent>) {
            let (tx, rx) = mpsc::channel(32);
            (
                Self {
                    bodies: HashMap::new(),
                    post_data: HashMap::new(),
                    events: tokio::sync::Mutex::new(rx),
                },
                tx,
            )
        }
    }

    #[async_trait]
    impl CdpTransport for MockTransport {
        async fn next_event(&self) -> Option<TransportEvent> {
            self.events.lock().await.recv().await
        }

        async fn send_command(
            &self,
            _target: CommandTarget,
            method: &str,
            params: Value,
        ) -> Result<Value, AdapterError> {
            let id = params["requestId"].as_str().unwrap_or_default();
            let table = match method {
                "Network.getResponseBody" => &self.bodies,
                "Network.getRequestPostData" => &self.post_data,
                _ => return Ok(json!({})),
            };
            table.get(id).cloned().ok_or_else(|| {
                AdapterError::new(AdapterErrorKind::CdpIo)
                    .with_hint("No resource with given identifier found")
            })
        }
    }

    fn event(session: &str, method: &str, params: Value) -> TransportEvent {
        TransportEvent {
            method: method.to_string(),
            params,
            session_id: Some(session.to_string()),
        }
    }

    fn request_sent(id: &str, method: &str, url: &str, extra: Value) -> Value {
        let mut params = json!({
            "requestId": id,
            "request": { "url": url, "method": method, "headers": { "Accept": "application/json" } },
            "timestamp": 100.0,
            "wallTime": 1_700_000_000.5,
            "initiator": { "type": "script" }
        });
        if let (Some(target), Value::Object(extra)) = (params.as_object_mut(), extra) {
            target.extend(extra);
        }
        params
    }

    async fn next_record(rx: &mut mpsc::Receiver<ProtocolRecord>) -> ProtocolRecord {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("record in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn finished_transaction_carries_bodies_and_timing() {
        let (mut mock, _events) = MockTransport::new();
        mock.bodies.insert(
            "R1".into(),
            json!({ "body": "{\"data\":\"XYZ\"}", "base64Encoded": false }),
        );
        let (tx, mut rx) = mpsc::channel(8);
        let mut assembler = NetworkAssembler::new(Arc::new(mock), "S", tx, true);

        assembler.handle_event(event(
            "S",
            "Network.requestWillBeSent",
            request_sent(
                "R1",
                "POST",
                "http://localhost:5173/api/echo",
                json!({ "request": {
                    "url": "http://localhost:5173/api/echo",
                    "method": "POST",
                    "headers": {},
                    "postData": "a1b2c3",
                    "hasPostData": true
                }}),
            ),
        ));
        assembler.handle_event(event(
            "S",
            "Network.responseReceived",
            json!({
                "requestId": "R1",
                "response": {
                    "status": 200,
                    "statusText": "OK",
                    "headers": { "content-type": "application/json", "content-length": 14 },
                    "requestHeadersText": "POST /api/echo HTTP/1.1",
                    "timing": { "requestTime": 100.0 }
                }
            }),
        ));
        assembler.handle_event(event(
            "S",
            "Network.loadingFinished",
            json!({ "requestId": "R1", "timestamp": 100.25, "encodedDataLength": 321.0 }),
        ));

        let record = next_record(&mut rx).await;
        assert_eq!(record.request.method, "POST");
        assert_eq!(record.started_at, Some(1_700_000_000_500.0));
        assert_eq!(record.duration_ms, Some(250.0));
        assert_eq!(record.encoded_data_length, Some(321));
        assert_eq!(record.initiator_type.as_deref(), Some("script"));
        assert_eq!(record.response.status, 200);
        assert_eq!(
            record.response.headers.get("content-length").map(String::as_str),
            Some("14")
        );
        assert_eq!(
            record.request.headers_text.as_deref(),
            Some("POST /api/echo HTTP/1.1")
        );
        assert_eq!(record.request.body, Some(json!("a1b2c3")));
        assert_eq!(record.response.body, Some(json!({ "data": "XYZ" })));
        assert_eq!(record.timing, Some(json!({ "requestTime": 100.0 })));
        assert_eq!(assembler.inflight_len(), 0);
    }

    #[tokio::test]
    async fn failed_transaction_reports_status_zero() {
        let (mock, _events) = MockTransport::new();
        let (tx, mut rx) = mpsc::channel(8);
        let mut assembler = NetworkAssembler::new(Arc::new(mock), "S", tx, true);

        assembler.handle_event(event(
            "S",
            "Network.requestWillBeSent",
            request_sent("R2", "GET", "http://localhost:5173/api/down", json!({})),
        ));
        assembler.handle_event(event(
            "S",
            "Network.loadingFailed",
            json!({ "requestId": "R2", "timestamp": 100.5, "errorText": "net::ERR_CONNECTION_REFUSED" }),
        ));

        let record = next_record(&mut rx).await;
        assert_eq!(record.response.status, 0);
        assert_eq!(record.response.status_text, "net::ERR_CONNECTION_REFUSED");
        assert!(record.response.body.is_none());
    }

    #[tokio::test]
    async fn missing_bodies_and_disabled_capture_leave_body_absent() {
        let (mock, _events) = MockTransport::new();
        let (tx, mut rx) = mpsc::channel(8);
        let mut assembler = NetworkAssembler::new(Arc::new(mock), "S", tx, true);

        for (id, capture) in [("R3", true), ("R4", false)] {
            assembler.capture_bodies().store(capture, Ordering::Relaxed);
            assembler.handle_event(event(
                "S",
                "Network.requestWillBeSent",
                request_sent(id, "GET", "http://localhost:5173/api/ping", json!({})),
            ));
            assembler.handle_event(event(
                "S",
                "Network.loadingFinished",
                json!({ "requestId": id, "timestamp": 101.0 }),
            ));
            let record = next_record(&mut rx).await;
            assert!(record.request.body.is_none());
            assert!(record.response.body.is_none());
        }
    }

    #[tokio::test]
    async fn redirect_hop_becomes_its_own_record() {
        let (mock, _events) = MockTransport::new();
        let (tx, mut rx) = mpsc::channel(8);
        let mut assembler = NetworkAssembler::new(Arc::new(mock), "S", tx, false);

        assembler.handle_event(event(
            "S",
            "Network.requestWillBeSent",
            request_sent("R5", "GET", "http://localhost:5173/old", json!({})),
        ));
        assembler.handle_event(event(
            "S",
            "Network.requestWillBeSent",
            request_sent(
                "R5",
                "GET",
                "http://localhost:5173/new",
                json!({
                    "request": { "url": "http://localhost:5173/new", "method": "GET", "headers": {} },
                    "redirectResponse": { "status": 302, "statusText": "Found", "headers": { "location": "/new" } }
                }),
            ),
        ));

        let hop = next_record(&mut rx).await;
        assert_eq!(hop.request.url, "http://localhost:5173/old");
        assert_eq!(hop.response.status, 302);
        assert_eq!(assembler.inflight_len(), 1);
    }

    #[tokio::test]
    async fn other_sessions_are_ignored_and_detach_stops() {
        let (mock, _events) = MockTransport::new();
        let (tx, mut rx) = mpsc::channel(8);
        let mut assembler = NetworkAssembler::new(Arc::new(mock), "S", tx, false);

        assert!(assembler.handle_event(event(
            "OTHER",
            "Network.requestWillBeSent",
            request_sent("R6", "GET", "http://localhost:5173/x", json!({})),
        )));
        assert_eq!(assembler.inflight_len(), 0);
        assert!(rx.try_recv().is_err());

        let detached = TransportEvent {
            method: "Target.detachedFromTarget".into(),
            params: json!({ "sessionId": "S" }),
            session_id: None,
        };
        assert!(!assembler.handle_event(detached));
    }

    #[tokio::test]
    async fn unfinished_transactions_are_capped() {
        let (mock, _events) = MockTransport::new();
        let (tx, _rx) = mpsc::channel(8);
        let mut assembler = NetworkAssembler::new(Arc::new(mock), "S", tx, false);

        for n in 0..(MAX_INFLIGHT + 5) {
            assembler.handle_event(event(
                "S",
                "Network.requestWillBeSent",
                request_sent(&format!("R{n}"), "GET", "http://localhost:5173/poll", json!({})),
            ));
        }
        assert_eq!(assembler.inflight_len(), MAX_INFLIGHT);
        assert!(!assembler.inflight.contains_key("R0"));
        assert!(assembler.inflight.contains_key(&format!("R{}", MAX_INFLIGHT + 4)));
    }

    #[tokio::test]
    async fn pump_stops_on_cancel() {
        let (mock, events) = MockTransport::new();
        let (tx, mut rx) = mpsc::channel(8);
        let assembler = NetworkAssembler::new(Arc::new(mock), "S", tx, false);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(pump_events(assembler, cancel.clone()));

        events
            .send(event(
                "S",
                "Network.requestWillBeSent",
                request_sent("R7", "GET", "http://localhost:5173/a", json!({})),
            ))
            .await
            .unwrap();
        events
            .send(event(
                "S",
                "Network.loadingFinished",
                json!({ "requestId": "R7", "timestamp": 100.1 }),
            ))
            .await
            .unwrap();
        let record = next_record(&mut rx).await;
        assert_eq!(record.request.url, "http://localhost:5173/a");

        cancel.cancel();
        timeout(Duration::from_secs(1), task)
            .await
            .expect("pump stops")
            .expect("pump task");
    }
}
