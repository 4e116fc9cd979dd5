//! Inbound request types for the generation endpoints.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The `{action}` half of a `{model}:{action}` path segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerateAction {
    /// `generateContent`
    Generate,
    /// `streamGenerateContent`
    StreamGenerate,
}

impl GenerateAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerateAction::Generate => "generateContent",
            GenerateAction::StreamGenerate => "streamGenerateContent",
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, GenerateAction::StreamGenerate)
    }
}

/// How the upstream is called for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamShape {
    /// Upstream SSE relayed byte for byte, closed with `data: [DONE]`.
    NativeStream,
    /// Single `generateContent` call wrapped in heartbeat/result frames.
    Buffered,
}

/// Chooses the upstream shape from the action and the caller's config
/// variant.
///
/// Only listed variants have a backend that can stream natively; a
/// `streamGenerateContent` call from any other variant is served buffered.
#[derive(Debug, Clone)]
pub struct StreamRouting {
    native_variants: Arc<[String]>,
}

impl Default for StreamRouting {
    fn default() -> Self {
        Self::new(["gemini-cli"])
    }
}

impl StreamRouting {
    pub fn new<I, S>(native_variants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            native_variants: native_variants.into_iter().map(Into::into).collect(),
        }
    }

    pub fn shape(&self, action: GenerateAction, variant: Option<&str>) -> UpstreamShape {
        let native = action.is_streaming()
            && variant.is_some_and(|v| self.native_variants.iter().any(|n| n == v));
        if native {
            UpstreamShape::NativeStream
        } else {
            UpstreamShape::Buffered
        }
    }
}

/// Parsed `{model}:{action}` path segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelTarget {
    pub model: String,
    pub action: GenerateAction,
}

impl FromStr for ModelTarget {
    type Err = String;

    fn from_str(segment: &str) -> Result<Self, Self::Err> {
        let (model, action) = segment
            .rsplit_once(':')
            .ok_or_else(|| format!("Expected '{{model}}:{{action}}', got '{}'", segment))?;

        if model.trim().is_empty() {
            return Err("Model name is empty".to_string());
        }

        let action = match action {
            "generateContent" => GenerateAction::Generate,
            "streamGenerateContent" => GenerateAction::StreamGenerate,
            other => return Err(format!("Unsupported action '{}'", other)),
        };

        Ok(Self {
            model: model.to_string(),
            action,
        })
    }
}

impl fmt::Display for ModelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.model, self.action.as_str())
    }
}

/// Query string of the generation endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerateQuery {
    /// Response format; only `sse` is served for streaming calls.
    pub alt: Option<String>,
}

/// Generation request body.
///
/// Only `contents` is inspected; every other field is forwarded as-is.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GenerateContentRequest {
    pub contents: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GenerateContentRequest {
    /// Parse and validate a raw request body.
    pub fn parse(body: &[u8]) -> Result<Self, String> {
        let request: Self =
            serde_json::from_slice(body).map_err(|e| format!("Invalid request body: {}", e))?;
        if request.contents.is_empty() {
            return Err("'contents' must not be empty".to_string());
        }
        Ok(request)
    }

    /// Body to send upstream.
    pub fn into_value(self) -> Value {
        let mut body = self.extra;
        body.insert("contents".to_string(), Value::Array(self.contents));
        Value::Object(body)
    }
}
