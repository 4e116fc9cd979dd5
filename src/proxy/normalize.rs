//! Canonical error envelopes for heterogeneous upstream error payloads.
//!
//! Upstream backends report failures in several shapes (`{"detail": ..}`,
//! `{"error": "text"}`, `{"error": {"message": .., "code": ..}}`,
//! `{"message": ..}` or plain text). [`extract_message`] walks an ordered
//! chain of extraction attempts and the first one that yields text wins;
//! the last link always matches, so every payload produces a message.

use serde::Serialize;
use serde_json::Value;

/// Code used when a payload carries no usable numeric `code`/`status`.
pub const DEFAULT_ERROR_CODE: u16 = 500;

/// The `type` field of an error envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    #[serde(rename = "upstream_error")]
    Upstream,
    #[serde(rename = "internal_error")]
    Internal,
    #[serde(rename = "authentication_error")]
    Authentication,
    #[serde(rename = "invalid_request_error")]
    InvalidRequest,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Upstream => "upstream_error",
            ErrorKind::Internal => "internal_error",
            ErrorKind::Authentication => "authentication_error",
            ErrorKind::InvalidRequest => "invalid_request_error",
        }
    }
}

/// Inner `{message, type, code}` object of the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub code: u16,
}

/// `{"error": {"message": .., "type": .., "code": ..}}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

impl ErrorEnvelope {
    pub fn new(kind: ErrorKind, message: impl Into<String>, code: u16) -> Self {
        Self {
            error: ErrorBody {
                message: message.into(),
                kind,
                code,
            },
        }
    }

    /// Envelope for an upstream HTTP failure. The code is the HTTP status,
    /// not whatever the body claims.
    pub fn from_upstream(status: u16, body: &Value) -> Self {
        let (_, message) = extract_message(body);
        Self::new(ErrorKind::Upstream, message, status)
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "error": {
                "message": self.error.message,
                "type": self.error.kind.as_str(),
                "code": self.error.code,
            }
        })
    }
}

/// Which link of the extraction chain produced the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSource {
    Detail,
    ErrorText,
    ErrorMessage,
    ErrorDetail,
    ErrorObject,
    Message,
    Payload,
}

type Extractor = fn(&Value) -> Option<String>;

const MESSAGE_CHAIN: [(MessageSource, Extractor); 6] = [
    (MessageSource::Detail, detail),
    (MessageSource::ErrorText, error_text),
    (MessageSource::ErrorMessage, error_message),
    (MessageSource::ErrorDetail, error_detail),
    (MessageSource::ErrorObject, error_object),
    (MessageSource::Message, top_level_message),
];

/// Normalize an arbitrary upstream error payload.
///
/// The returned body is typed `upstream_error`; `code` falls back to
/// [`DEFAULT_ERROR_CODE`].
pub fn normalize(raw: &Value) -> ErrorBody {
    let (_, message) = extract_message(raw);
    ErrorBody {
        message,
        kind: ErrorKind::Upstream,
        code: extract_code(raw).unwrap_or(DEFAULT_ERROR_CODE),
    }
}

/// Run the extraction chain. Links whose value is null or blank are skipped.
pub fn extract_message(raw: &Value) -> (MessageSource, String) {
    MESSAGE_CHAIN
        .iter()
        .find_map(|(source, extract)| extract(raw).map(|m| (*source, m)))
        .unwrap_or_else(|| (MessageSource::Payload, payload_text(raw)))
}

/// First parseable status-like code: `error.code`, `error.status`, `code`, `status`.
pub fn extract_code(raw: &Value) -> Option<u16> {
    let nested = raw.get("error").filter(|e| e.is_object());
    [
        nested.and_then(|e| e.get("code")),
        nested.and_then(|e| e.get("status")),
        raw.get("code"),
        raw.get("status"),
    ]
    .into_iter()
    .flatten()
    .find_map(parse_code)
}

fn parse_code(value: &Value) -> Option<u16> {
    let code = match value {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse::<u64>().ok()?,
        _ => return None,
    };
    (100..=599).contains(&code).then_some(code as u16)
}

/// Text form of a field: strings verbatim, other non-null values as compact JSON.
fn field_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn detail(raw: &Value) -> Option<String> {
    raw.get("detail").and_then(field_text)
}

fn error_text(raw: &Value) -> Option<String> {
    match raw.get("error")? {
        Value::String(_) => raw.get("error").and_then(field_text),
        _ => None,
    }
}

fn error_message(raw: &Value) -> Option<String> {
    raw.get("error")?.as_object()?.get("message").and_then(field_text)
}

fn error_detail(raw: &Value) -> Option<String> {
    raw.get("error")?.as_object()?.get("detail").and_then(field_text)
}

fn error_object(raw: &Value) -> Option<String> {
    match raw.get("error")? {
        Value::String(_) => None,
        other => field_text(other),
    }
}

fn top_level_message(raw: &Value) -> Option<String> {
    raw.get("message").and_then(field_text)
}

fn payload_text(raw: &Value) -> String {
    match raw {
        Value::String(s) if s.trim().is_empty() => "empty upstream error body".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
