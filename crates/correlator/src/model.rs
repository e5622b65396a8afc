//! Records observed at the protocol layer and plaintext events observed inside the page.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identifier assigned to a protocol record at capture time.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RecordId(pub Uuid);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type Headers = BTreeMap<String, String>;

/// One finished transaction as seen on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolRecord {
    pub id: RecordId,
    /// Epoch milliseconds, same clock domain as the page's `Date.now()`.
    pub started_at: Option<f64>,
    pub duration_ms: Option<f64>,
    pub encoded_data_length: Option<u64>,
    pub initiator_type: Option<String>,
    pub request: RequestPart,
    pub response: ResponsePart,
    /// Opaque timing breakdown as reported by the protocol layer.
    pub timing: Option<Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPart {
    pub method: String,
    pub url: String,
    pub headers: Headers,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers_text: Option<String>,
    pub body: Option<Value>,
    pub plain_body: Option<Value>,
    pub decrypted_body: Option<Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePart {
    pub status: i64,
    pub status_text: String,
    pub headers: Headers,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers_text: Option<String>,
    pub body: Option<Value>,
    pub plain_body: Option<Value>,
    pub decrypted_body: Option<Value>,
}

/// Which half of a record a body belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodySide {
    Request,
    Response,
}

impl ProtocolRecord {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: RecordId::new(),
            started_at: None,
            duration_ms: None,
            encoded_data_length: None,
            initiator_type: None,
            request: RequestPart {
                method: method.into(),
                url: url.into(),
                ..RequestPart::default()
            },
            response: ResponsePart::default(),
            timing: None,
        }
    }

    pub fn captured_body(&self, side: BodySide) -> Option<&Value> {
        match side {
            BodySide::Request => self.request.body.as_ref(),
            BodySide::Response => self.response.body.as_ref(),
        }
    }

    /// Attach correlated plaintext. Returns false when the slot was already filled.
    pub fn attach_plain(&mut self, side: BodySide, value: Value) -> bool {
        let slot = match side {
            BodySide::Request => &mut self.request.plain_body,
            BodySide::Response => &mut self.response.plain_body,
        };
        fill_once(slot, value)
    }

    /// Attach a decryption result. Returns false when the slot was already filled.
    pub fn attach_decrypted(&mut self, side: BodySide, value: Value) -> bool {
        let slot = match side {
            BodySide::Request => &mut self.request.decrypted_body,
            BodySide::Response => &mut self.response.decrypted_body,
        };
        fill_once(slot, value)
    }

    pub fn has_plain(&self, side: BodySide) -> bool {
        match side {
            BodySide::Request => self.request.plain_body.is_some(),
            BodySide::Response => self.response.plain_body.is_some(),
        }
    }
}

// Attached fields are write-once: a null never fills a slot and a filled slot is never replaced.
fn fill_once(slot: &mut Option<Value>, value: Value) -> bool {
    if slot.is_some() || value.is_null() {
        return false;
    }
    *slot = Some(value);
    true
}

/// Page call-site family that produced a plaintext event.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallSite {
    /// `request` entry point of a promise-based HTTP client, outside its interceptor chain.
    Client,
    Fetch,
    Xhr,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPhase {
    Request,
    Response,
}

/// Send or receive event captured by the in-page agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlainEvent {
    pub site: CallSite,
    pub phase: EventPhase,
    pub method: String,
    pub url: String,
    /// Origin-stripped form including the query string.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub body: Option<Value>,
    /// Page clock, epoch milliseconds.
    pub ts: f64,
    #[serde(default)]
    pub status: Option<i64>,
}

/// Decode captured body text: JSON-looking documents are parsed, anything else is kept raw.
pub fn parse_body_text(text: &str) -> Value {
    let trimmed = text.trim();
    let looks_structured = (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'));
    if looks_structured {
        if let Ok(value) = serde_json::from_str(trimmed) {
            return value;
        }
    }
    Value::String(text.to_string())
}

/// Body content as returned by the protocol layer. Empty content yields no body.
pub fn decode_body(content: &str, base64_encoded: bool) -> Option<Value> {
    if content.is_empty() {
        return None;
    }
    if base64_encoded {
        return Some(Value::String(format!("[base64] {} chars", content.len())));
    }
    Some(parse_body_text(content))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn attached_fields_are_write_once() {
        let mut record = ProtocolRecord::new("POST", "http://localhost/api/echo");
        assert!(record.attach_plain(BodySide::Request, json!({"hello": "world"})));
        assert!(!record.attach_plain(BodySide::Request, json!({"hello": "other"})));
        assert_eq!(record.request.plain_body, Some(json!({"hello": "world"})));

        assert!(!record.attach_decrypted(BodySide::Response, Value::Null));
        assert!(record.attach_decrypted(BodySide::Response, json!({"ok": true})));
        assert!(!record.attach_decrypted(BodySide::Response, json!({"ok": false})));
        assert_eq!(record.response.decrypted_body, Some(json!({"ok": true})));
    }

    #[test]
    fn body_text_parsing_falls_back_to_raw() {
        assert_eq!(parse_body_text(" {\"a\":1} "), json!({"a": 1}));
        assert_eq!(parse_body_text("[1,2]"), json!([1, 2]));
        assert_eq!(parse_body_text("{broken"), json!("{broken"));
        assert_eq!(parse_body_text("{not json}"), json!("{not json}"));
        assert_eq!(parse_body_text("a1b2c3"), json!("a1b2c3"));
    }

    #[test]
    fn base64_bodies_are_summarized() {
        assert_eq!(decode_body("", false), None);
        assert_eq!(decode_body("QUJD", true), Some(json!("[base64] 4 chars")));
    }

    #[test]
    fn plain_event_accepts_page_shape() {
        let event: PlainEvent = serde_json::from_value(json!({
            "site": "fetch",
            "phase": "request",
            "method": "POST",
            "url": "http://localhost:5173/api/echo",
            "path": "/api/echo",
            "body": {"hello": "world"},
            "ts": 1700000000000.0
        }))
        .expect("decode event");
        assert_eq!(event.site, CallSite::Fetch);
        assert_eq!(event.phase, EventPhase::Request);
        assert_eq!(event.status, None);
    }

    #[test]
    fn export_uses_camel_case() {
        let record = ProtocolRecord::new("GET", "http://localhost/api/ping");
        let value = serde_json::to_value(&record).expect("serialize");
        assert!(value.get("startedAt").is_some());
        assert!(value["request"].get("plainBody").is_some());
        assert!(value["response"].get("decryptedBody").is_some());
    }
}
