//! Outbound calls to the upstream inference backend.

use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::{header, Client, Response};
use serde_json::Value;

use super::normalize::{ErrorEnvelope, ErrorKind, DEFAULT_ERROR_CODE};
use crate::config::ApiKey;

/// Header carrying the caller's account/config variant upstream.
pub const ACCOUNT_TYPE_HEADER: &str = "X-Account-Type";

/// Live upstream body: finite, forwarded chunk by chunk, not restartable.
pub type ByteStream = BoxStream<'static, Result<Bytes, reqwest::Error>>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The backend answered with status >= 400.
    #[error("Upstream returned {status}")]
    Upstream { status: u16, body: Value },

    #[error("Failed to reach upstream: {0}")]
    Request(#[source] reqwest::Error),

    #[error("Failed to decode upstream response: {0}")]
    Decode(#[source] reqwest::Error),
}

impl TransportError {
    /// Client-facing envelope for this failure.
    pub fn envelope(&self) -> ErrorEnvelope {
        match self {
            TransportError::Upstream { status, body } => ErrorEnvelope::from_upstream(*status, body),
            other => ErrorEnvelope::new(ErrorKind::Internal, other.to_string(), DEFAULT_ERROR_CODE),
        }
    }
}

/// One generation call, owned so it can move into a background task.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub model: String,
    pub body: Value,
    pub api_key: ApiKey,
    pub account_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: Client,
    base_url: String,
}

impl UpstreamClient {
    /// `request_timeout` bounds the whole call, body included;
    /// `connect_timeout` bounds connection setup.
    pub fn new(
        base_url: impl Into<String>,
        request_timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self::with_client(http, base_url))
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, model: &str, action: &str) -> String {
        format!("{}/v1beta/models/{}:{}", self.base_url, model, action)
    }

    async fn send(&self, url: String, request: &UpstreamRequest) -> Result<Response, TransportError> {
        let mut builder = self
            .http
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .bearer_auth(request.api_key.expose_secret())
            .json(&request.body);

        if let Some(account_type) = &request.account_type {
            builder = builder.header(ACCOUNT_TYPE_HEADER, account_type);
        }

        let response = builder.send().await.map_err(|e| {
            tracing::error!(error = %e, model = %request.model, "Failed to reach upstream");
            TransportError::Request(e)
        })?;

        if response.status().as_u16() >= 400 {
            return Err(upstream_error(response, &request.model).await);
        }
        Ok(response)
    }

    /// Single blocking call; the whole JSON body is returned.
    pub async fn call_buffered(&self, request: &UpstreamRequest) -> Result<Value, TransportError> {
        let url = self.url(&request.model, "generateContent");
        let response = self.send(url, request).await?;

        response.json::<Value>().await.map_err(|e| {
            tracing::error!(error = %e, model = %request.model, "Failed to decode upstream response");
            TransportError::Decode(e)
        })
    }

    /// Native SSE call; chunks are handed over as they arrive.
    pub async fn call_streaming(&self, request: &UpstreamRequest) -> Result<ByteStream, TransportError> {
        let url = format!("{}?alt=sse", self.url(&request.model, "streamGenerateContent"));
        let response = self.send(url, request).await?;
        Ok(response.bytes_stream().boxed())
    }
}

/// Read an error body, keeping it as JSON when it parses and as text otherwise.
async fn upstream_error(response: Response, model: &str) -> TransportError {
    let status = response.status().as_u16();
    let body = match response.bytes().await {
        Ok(bytes) => serde_json::from_slice::<Value>(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned())),
        Err(e) => Value::String(e.to_string()),
    };

    tracing::error!(status, model = %model, body = %body, "Upstream returned error");
    TransportError::Upstream { status, body }
}
