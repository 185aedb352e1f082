//! RPC envelope: one unit of message-bus traffic.

use std::collections::HashMap;

use chrono::{DateTime, FixedOffset};
use tidelog_common::Value;
use uuid::Uuid;

/// Message-bus traffic class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    /// RPC request
    Request,
    /// RPC response, correlated to a request by `in_reply_to`
    Response,
    /// Unsolicited server push
    Trap,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Request => "Request",
            EnvelopeKind::Response => "Response",
            EnvelopeKind::Trap => "Trap",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Request" => Some(EnvelopeKind::Request),
            "Response" => Some(EnvelopeKind::Response),
            "Trap" => Some(EnvelopeKind::Trap),
            _ => None,
        }
    }
}

/// One RPC envelope.
///
/// Every response's `in_reply_to` must name a previously sent request;
/// a response that matches no outstanding request is unroutable and is
/// dropped with a warning by the connection.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub id: Uuid,
    pub kind: EnvelopeKind,
    pub session: Option<String>,
    pub in_reply_to: Option<Uuid>,
    pub source: String,
    pub target: String,
    pub method: String,
    pub params: HashMap<String, Value>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl Envelope {
    /// New request envelope for the given method.
    pub fn request(method: &str) -> Envelope {
        Envelope {
            id: Uuid::new_v4(),
            kind: EnvelopeKind::Request,
            session: None,
            in_reply_to: None,
            source: "0".to_string(),
            target: "0".to_string(),
            method: method.to_string(),
            params: HashMap::new(),
            error_code: None,
            error_message: None,
        }
    }

    /// New response envelope answering `req`.
    pub fn response_to(req: &Envelope) -> Envelope {
        Envelope {
            id: Uuid::new_v4(),
            kind: EnvelopeKind::Response,
            session: req.session.clone(),
            in_reply_to: Some(req.id),
            source: req.target.clone(),
            target: req.source.clone(),
            method: req.method.clone(),
            params: HashMap::new(),
            error_code: None,
            error_message: None,
        }
    }

    /// New one-way trap envelope.
    pub fn trap(method: &str) -> Envelope {
        Envelope {
            kind: EnvelopeKind::Trap,
            ..Envelope::request(method)
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Envelope {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.params.get(key).and_then(Value::as_i64)
    }

    /// Non-negative integer view of a parameter.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get_i64(key).and_then(|n| u64::try_from(n).ok())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.params.get(key).and_then(Value::as_bool)
    }

    pub fn get_date(&self, key: &str) -> Option<DateTime<FixedOffset>> {
        self.params.get(key).and_then(Value::as_date)
    }

    /// True when the server reported a failure in this envelope.
    pub fn is_error(&self) -> bool {
        self.error_code.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let req = Envelope::request("tidelog.query.create");
        assert_eq!(req.kind, EnvelopeKind::Request);
        assert_eq!(req.source, "0");
        assert_eq!(req.target, "0");
        assert!(req.in_reply_to.is_none());
        assert!(!req.is_error());
    }

    #[test]
    fn test_response_correlates() {
        let req = Envelope::request("tidelog.query.start").with_param("id", 3i64);
        let resp = Envelope::response_to(&req);
        assert_eq!(resp.kind, EnvelopeKind::Response);
        assert_eq!(resp.in_reply_to, Some(req.id));
        assert_eq!(resp.method, req.method);
    }

    #[test]
    fn test_param_accessors() {
        let env = Envelope::request("m")
            .with_param("name", "t1")
            .with_param("count", 42i64)
            .with_param("flag", true);
        assert_eq!(env.get_str("name"), Some("t1"));
        assert_eq!(env.get_i64("count"), Some(42));
        assert_eq!(env.get_u64("count"), Some(42));
        assert_eq!(env.get_bool("flag"), Some(true));
        assert_eq!(env.get_str("missing"), None);
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!(EnvelopeKind::parse("Request"), Some(EnvelopeKind::Request));
        assert_eq!(EnvelopeKind::parse("Trap"), Some(EnvelopeKind::Trap));
        assert_eq!(EnvelopeKind::parse("bogus"), None);
    }
}
