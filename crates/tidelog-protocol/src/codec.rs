//! JSON wire form for RPC envelopes.
//!
//! An envelope is a two-element array `[header, body]`. The header carries
//! routing fields; the body is the parameter map. Encode and decode are
//! near-total inverses: date values serialize to a fixed textual timestamp
//! with timezone offset and parse back to dates, everything else passes
//! through unchanged. Decoding is tolerant of a malformed body entry: it is
//! logged and omitted rather than failing the whole envelope.

use std::collections::HashMap;

use chrono::DateTime;
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use tracing::warn;
use uuid::Uuid;

use tidelog_common::{Error, Result, Value};

use crate::envelope::{Envelope, EnvelopeKind};

/// Textual timestamp format for date values, e.g. `2024-01-02 03:04:05+0900`.
const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%z";

/// Encode an envelope to its JSON wire form.
pub fn encode(env: &Envelope) -> String {
    let mut header = JsonMap::new();
    header.insert("id".into(), json!(env.id.to_string()));
    header.insert("type".into(), json!(env.kind.as_str()));
    header.insert("method".into(), json!(env.method));
    header.insert("source".into(), json!(env.source));
    header.insert("target".into(), json!(env.target));
    if let Some(reply) = &env.in_reply_to {
        header.insert("in_reply_to".into(), json!(reply.to_string()));
    }
    if let Some(session) = &env.session {
        header.insert("session".into(), json!(session));
    }
    if let Some(code) = &env.error_code {
        header.insert("error_code".into(), json!(code));
        header.insert("error_message".into(), json!(env.error_message));
    }

    let mut body = JsonMap::new();
    for (key, value) in &env.params {
        body.insert(key.clone(), value_to_json(value));
    }

    JsonValue::Array(vec![JsonValue::Object(header), JsonValue::Object(body)]).to_string()
}

/// Decode an envelope from its JSON wire form.
///
/// A malformed header fails the decode; a malformed body entry is dropped.
pub fn decode(text: &str) -> Result<Envelope> {
    let root: JsonValue = serde_json::from_str(text)?;
    let parts = root
        .as_array()
        .filter(|a| a.len() == 2)
        .ok_or_else(|| Error::Protocol("envelope is not a two-element array".to_string()))?;
    let header = parts[0]
        .as_object()
        .ok_or_else(|| Error::Protocol("envelope header is not an object".to_string()))?;
    let body = parts[1]
        .as_object()
        .ok_or_else(|| Error::Protocol("envelope body is not an object".to_string()))?;

    let id = parse_uuid(header, "id")?
        .ok_or_else(|| Error::Protocol("envelope header missing id".to_string()))?;
    let kind = header
        .get("type")
        .and_then(JsonValue::as_str)
        .and_then(EnvelopeKind::parse)
        .ok_or_else(|| Error::Protocol("envelope header missing or invalid type".to_string()))?;
    let method = header
        .get("method")
        .and_then(JsonValue::as_str)
        .map(|s| s.trim().to_string())
        .ok_or_else(|| Error::Protocol("envelope header missing method".to_string()))?;

    let mut params = HashMap::with_capacity(body.len());
    for (key, value) in body {
        match json_to_value(value) {
            Some(v) => {
                params.insert(key.clone(), v);
            }
            None => warn!(key = %key, "dropping malformed envelope parameter"),
        }
    }

    Ok(Envelope {
        id,
        kind,
        session: header_str(header, "session"),
        in_reply_to: parse_uuid(header, "in_reply_to")?,
        source: header_str(header, "source").unwrap_or_else(|| "0".to_string()),
        target: header_str(header, "target").unwrap_or_else(|| "0".to_string()),
        method,
        params,
        error_code: header_str(header, "error_code"),
        error_message: header_str(header, "error_message"),
    })
}

fn header_str(header: &JsonMap<String, JsonValue>, key: &str) -> Option<String> {
    header.get(key).and_then(JsonValue::as_str).map(str::to_string)
}

fn parse_uuid(header: &JsonMap<String, JsonValue>, key: &str) -> Result<Option<Uuid>> {
    match header.get(key).and_then(JsonValue::as_str) {
        Some(s) => Uuid::parse_str(s.trim())
            .map(Some)
            .map_err(|e| Error::Protocol(format!("invalid {} in envelope header: {}", key, e))),
        None => Ok(None),
    }
}

/// Map a value into its JSON wire representation.
pub fn value_to_json(value: &Value) -> JsonValue {
    match value {
        Value::Null => JsonValue::Null,
        Value::Bool(b) => json!(b),
        Value::Int(n) => json!(n),
        Value::Float(f) => json!(f),
        Value::String(s) => json!(s),
        Value::Date(d) => json!(d.format(DATE_FORMAT).to_string()),
        Value::Array(items) => JsonValue::Array(items.iter().map(value_to_json).collect()),
        Value::Map(entries) => JsonValue::Object(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), value_to_json(v)))
                .collect(),
        ),
    }
}

/// Map a JSON wire value back into a [`Value`].
///
/// Strings in the fixed timestamp shape become dates. Returns `None` for a
/// value with no faithful mapping (an integer beyond the signed 64-bit
/// range); nested containers drop only the offending entry.
pub fn json_to_value(value: &JsonValue) -> Option<Value> {
    match value {
        JsonValue::Null => Some(Value::Null),
        JsonValue::Bool(b) => Some(Value::Bool(*b)),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(Value::Int(i))
            } else if n.is_f64() {
                n.as_f64().map(Value::Float)
            } else {
                // integer beyond the signed 64-bit range
                None
            }
        }
        JsonValue::String(s) => Some(parse_scalar(s)),
        JsonValue::Array(items) => Some(Value::Array(
            items
                .iter()
                .filter_map(|item| {
                    let v = json_to_value(item);
                    if v.is_none() {
                        warn!("dropping malformed array element");
                    }
                    v
                })
                .collect(),
        )),
        JsonValue::Object(entries) => Some(Value::Map(
            entries
                .iter()
                .filter_map(|(k, v)| match json_to_value(v) {
                    Some(v) => Some((k.clone(), v)),
                    None => {
                        warn!(key = %k, "dropping malformed map entry");
                        None
                    }
                })
                .collect(),
        )),
    }
}

fn parse_scalar(s: &str) -> Value {
    // 24 chars: "YYYY-MM-DD HH:MM:SS+ZZZZ"
    if s.len() == 24 {
        if let Ok(d) = DateTime::parse_from_str(s, DATE_FORMAT) {
            return Value::Date(d);
        }
    }
    Value::String(s.to_string())
}
