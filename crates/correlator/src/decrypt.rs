//! Decryption assist: calls a user-named page function on ciphertext-looking bodies.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::bridge::decrypt_expression;
use crate::eval::{evaluate_or_none, PageEvaluator};
use crate::metrics;
use crate::model::{BodySide, ProtocolRecord, RecordId};

#[derive(Clone, Debug)]
pub struct DecryptJob {
    pub record: RecordId,
    pub side: BodySide,
    pub function: String,
    pub candidate: Value,
}

#[derive(Clone, Debug)]
pub struct DecryptOutcome {
    pub record: RecordId,
    pub side: BodySide,
    pub value: Option<Value>,
}

/// Ciphertext candidates of a record whose decrypted slot is still empty.
///
/// A non-empty string body is a candidate as-is; a structured response body contributes its
/// `ciphertext_field` value.
pub fn candidates(record: &ProtocolRecord, ciphertext_field: &str) -> Vec<(BodySide, Value)> {
    let mut out = Vec::new();
    if record.request.decrypted_body.is_none() {
        if let Some(Value::String(text)) = record.captured_body(BodySide::Request) {
            if !text.is_empty() {
                out.push((BodySide::Request, Value::String(text.clone())));
            }
        }
    }
    if record.response.decrypted_body.is_none() {
        match record.captured_body(BodySide::Response) {
            Some(Value::String(text)) if !text.is_empty() => {
                out.push((BodySide::Response, Value::String(text.clone())));
            }
            Some(Value::Object(map)) => match map.get(ciphertext_field) {
                Some(Value::String(text)) if text.is_empty() => {}
                Some(Value::Null) | None => {}
                Some(inner) => out.push((BodySide::Response, inner.clone())),
            },
            _ => {}
        }
    }
    out
}

pub fn jobs_for(record: &ProtocolRecord, function: &str, ciphertext_field: &str) -> Vec<DecryptJob> {
    candidates(record, ciphertext_field)
        .into_iter()
        .map(|(side, candidate)| DecryptJob {
            record: record.id,
            side,
            function: function.to_string(),
            candidate,
        })
        .collect()
}

/// Fire-and-forget invoker. Each job runs as its own task and reports on `outcomes`;
/// completions arrive in any order.
#[derive(Clone)]
pub struct DecryptInvoker {
    evaluator: Arc<dyn PageEvaluator>,
    outcomes: mpsc::UnboundedSender<DecryptOutcome>,
}

impl DecryptInvoker {
    pub fn new(
        evaluator: Arc<dyn PageEvaluator>,
    ) -> (Self, mpsc::UnboundedReceiver<DecryptOutcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                evaluator,
                outcomes: tx,
            },
            rx,
        )
    }

    pub fn dispatch(&self, job: DecryptJob) {
        let evaluator = Arc::clone(&self.evaluator);
        let outcomes = self.outcomes.clone();
        tokio::spawn(async move {
            let value = invoke(evaluator.as_ref(), &job).await;
            metrics::record_decrypt(value.is_some());
            let _ = outcomes.send(DecryptOutcome {
                record: job.record,
                side: job.side,
                value,
            });
        });
    }
}

pub async fn invoke(evaluator: &dyn PageEvaluator, job: &DecryptJob) -> Option<Value> {
    let expression = decrypt_expression(&job.function, &job.candidate);
    let value = evaluate_or_none(evaluator, &expression).await;
    if value.is_none() {
        debug!(
            target: "correlator",
            record = %job.record,
            function = %job.function,
            "decryption function returned nothing"
        );
    }
    value
}
