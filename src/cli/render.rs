//! Plain-text rendering of records for the terminal.

use std::fmt::Write as _;

use chrono::{TimeZone, Utc};
use cipherscope_correlator::model::Headers;
use cipherscope_correlator::ProtocolRecord;
use serde_json::Value;

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    if bytes == 0 {
        return "0 B".to_string();
    }
    let exponent = ((bytes as f64).ln() / 1024f64.ln()).floor() as usize;
    let exponent = exponent.min(UNITS.len() - 1);
    let scaled = bytes as f64 / 1024f64.powi(exponent as i32);
    format!("{scaled:.2} {}", UNITS[exponent])
}

/// Bytes on the wire, falling back to what the record itself knows about its size.
fn transfer_size(record: &ProtocolRecord) -> Option<u64> {
    record.encoded_data_length.or_else(|| {
        record
            .response
            .headers_text
            .as_ref()
            .map(|text| text.len() as u64)
    })
}

fn status_label(status: i64) -> String {
    if status == 0 {
        "(failed)".to_string()
    } else {
        status.to_string()
    }
}

/// One row: `#n METHOD URL STATUS duration size`.
pub fn summary_line(position: usize, record: &ProtocolRecord) -> String {
    let duration = record
        .duration_ms
        .map(|ms| format!("{} ms", ms.round() as i64))
        .unwrap_or_else(|| "-".to_string());
    let size = transfer_size(record)
        .map(format_bytes)
        .unwrap_or_else(|| "-".to_string());
    let mut markers = String::new();
    if record.request.plain_body.is_some() || record.response.plain_body.is_some() {
        markers.push_str(" [plain]");
    }
    if record.request.decrypted_body.is_some() || record.response.decrypted_body.is_some() {
        markers.push_str(" [decrypted]");
    }
    format!(
        "#{position} {} {} {} {duration} {size}{markers}",
        record.request.method,
        record.request.url,
        status_label(record.response.status)
    )
}

/// Case-insensitive match over url, method, status and initiator type.
pub fn matches_filter(record: &ProtocolRecord, needle: &str) -> bool {
    let needle = needle.trim().to_lowercase();
    if needle.is_empty() {
        return true;
    }
    let haystack = format!(
        "{} {} {} {}",
        record.request.url,
        record.request.method,
        record.response.status,
        record.initiator_type.as_deref().unwrap_or("")
    )
    .to_lowercase();
    haystack.contains(&needle)
}

fn body_text(body: Option<&Value>) -> String {
    match body {
        None | Some(Value::Null) => "(empty)".to_string(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

fn headers_text(headers: &Headers, raw: Option<&str>) -> String {
    if let Some(raw) = raw {
        return raw.trim_end().to_string();
    }
    if headers.is_empty() {
        return "(none)".to_string();
    }
    headers
        .iter()
        .map(|(name, value)| format!("{name}: {value}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn section(out: &mut String, title: &str, body: &str) {
    let _ = writeln!(out, "--- {title} ---");
    let _ = writeln!(out, "{body}");
}

/// Full detail view of one record.
pub fn detail(record: &ProtocolRecord) -> String {
    let mut out = String::new();

    let started = record
        .started_at
        .and_then(|ms| Utc.timestamp_millis_opt(ms as i64).single())
        .map(|at| at.to_rfc3339())
        .unwrap_or_default();
    let overview = format!(
        "Method: {}\nURL: {}\nStatus: {} {}\nType: {}\nStarted: {}\nTime: {}\nTransferred: {}",
        record.request.method,
        record.request.url,
        status_label(record.response.status),
        record.response.status_text,
        record.initiator_type.as_deref().unwrap_or(""),
        started,
        record
            .duration_ms
            .map(|ms| format!("{} ms", ms.round() as i64))
            .unwrap_or_default(),
        record
            .encoded_data_length
            .map(format_bytes)
            .unwrap_or_default(),
    );
    section(&mut out, "Overview", &overview);

    section(
        &mut out,
        "Request Headers",
        &headers_text(&record.request.headers, record.request.headers_text.as_deref()),
    );
    section(
        &mut out,
        "Response Headers",
        &headers_text(&record.response.headers, record.response.headers_text.as_deref()),
    );

    section(&mut out, "Request Body", &body_text(record.request.body.as_ref()));
    if let Some(plain) = record.request.plain_body.as_ref() {
        section(&mut out, "Request Body (plaintext)", &body_text(Some(plain)));
    }
    if let Some(decrypted) = record.request.decrypted_body.as_ref() {
        section(&mut out, "Request Body (decrypted)", &body_text(Some(decrypted)));
    }

    section(&mut out, "Response Body", &body_text(record.response.body.as_ref()));
    if let Some(plain) = record.response.plain_body.as_ref() {
        section(&mut out, "Response Body (plaintext)", &body_text(Some(plain)));
    }
    if let Some(decrypted) = record.response.decrypted_body.as_ref() {
        section(&mut out, "Response Body (decrypted)", &body_text(Some(decrypted)));
    }

    section(&mut out, "Timing", &body_text(record.timing.as_ref()));
    out
}
