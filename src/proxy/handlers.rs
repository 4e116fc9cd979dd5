//! HTTP request handlers.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, Uri},
    response::{IntoResponse, Response},
    Extension, Json,
};
use tower_http::request_id::RequestId;

use super::server::AppState;
use super::session::{StreamSession, Termination};
use super::sse::{self, Frame, FrameSink};
use super::stream::{emit_stream_error, relay_native_stream, UsageTracker};
use super::transport::UpstreamRequest;
use super::types::{GenerateContentRequest, GenerateQuery, ModelTarget, UpstreamShape};
use crate::error::Error;
use crate::storage::UsageLogSink;

/// Caller identity, set by the authentication layer in front of the gateway.
pub const CALLER_ID_HEADER: &str = "x-caller-id";
/// Optional account/config variant of the caller.
pub const ACCOUNT_TYPE_HEADER: &str = "x-account-type";

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Handle POST /v1beta/models/{model}:generateContent and
/// POST /v1beta/models/{model}:streamGenerateContent?alt=sse.
///
/// Malformed requests are refused with a JSON error. Everything else is
/// answered with an SSE stream produced by a detached task, which also
/// resolves the caller's credential and writes the usage record before the
/// response body ends.
pub async fn generate(
    State(state): State<AppState>,
    Path(target): Path<String>,
    Query(query): Query<GenerateQuery>,
    request_id: Option<Extension<RequestId>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Error> {
    let correlation_id = request_id
        .and_then(|Extension(id)| id.header_value().to_str().ok().map(str::to_string))
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let caller_id = header_str(&headers, CALLER_ID_HEADER)
        .ok_or_else(|| Error::Validation(format!("Missing '{}' header", CALLER_ID_HEADER)))?;
    let target: ModelTarget = target.parse().map_err(Error::Validation)?;
    let account_type = header_str(&headers, ACCOUNT_TYPE_HEADER);
    let shape = state.routing.shape(target.action, account_type.as_deref());

    tracing::info!(
        correlation_id = %correlation_id,
        caller_id = %caller_id,
        model = %target.model,
        streaming = target.action.is_streaming(),
        shape = ?shape,
        "Generation request"
    );

    let session = StreamSession::new(
        correlation_id,
        caller_id,
        uri.path(),
        target.model.clone(),
        account_type,
        target.action.is_streaming(),
    );

    let request = match validate(&target, &query, &body) {
        Ok(request) => request,
        Err(e) => return Err(reject(session, e, state.usage_log.as_ref()).await),
    };

    let (sink, frames) = sse::channel();
    tokio::spawn(produce(session, request.into_value(), shape, state, sink));

    Ok(sse::sse_response(frames))
}

fn validate(
    target: &ModelTarget,
    query: &GenerateQuery,
    body: &[u8],
) -> Result<GenerateContentRequest, Error> {
    if target.action.is_streaming() && query.alt.as_deref() != Some("sse") {
        return Err(Error::Validation(
            "streamGenerateContent requires 'alt=sse'".to_string(),
        ));
    }
    GenerateContentRequest::parse(body).map_err(Error::Validation)
}

/// Record a refused request and hand the error back for the response.
async fn reject(session: StreamSession, error: Error, usage_log: &dyn UsageLogSink) -> Error {
    tracing::warn!(
        correlation_id = %session.correlation_id,
        caller_id = %session.caller_id,
        error = %error,
        "Request rejected"
    );
    let envelope = error.envelope();
    session
        .reject(envelope.error.code, envelope.error.message, usage_log)
        .await;
    error
}

/// Per-request producer: resolve the credential, drive the upstream call
/// into the client stream, then write the usage record exactly once.
async fn produce(
    session: StreamSession,
    body: serde_json::Value,
    shape: UpstreamShape,
    state: AppState,
    sink: FrameSink,
) {
    let mut tracker = UsageTracker::new();

    let termination = match state.credentials.resolve(&session.caller_id).await {
        Ok(api_key) => {
            state.credentials.touch(&session.caller_id).await;
            let upstream = UpstreamRequest {
                model: session.model.clone(),
                body,
                api_key,
                account_type: session.config_type.clone(),
            };
            relay(shape, upstream, &state, &sink, &mut tracker).await
        }
        Err(e) => {
            let error = Error::from(e);
            if error.status().is_server_error() {
                tracing::error!(
                    correlation_id = %session.correlation_id,
                    error = %error,
                    "Credential lookup failed"
                );
            } else {
                tracing::warn!(
                    correlation_id = %session.correlation_id,
                    caller_id = %session.caller_id,
                    error = %error,
                    "Request rejected"
                );
            }
            refuse(shape, &error, &sink, &mut tracker).await
        }
    };

    tracing::info!(
        correlation_id = %session.correlation_id,
        termination = termination.as_str(),
        "Generation finished"
    );

    // The sink stays open until the record is written, so the response body
    // only ends once the outcome is durable.
    session
        .finish(tracker, termination, state.usage_log.as_ref())
        .await;
    drop(sink);
}

async fn relay(
    shape: UpstreamShape,
    upstream: UpstreamRequest,
    state: &AppState,
    sink: &FrameSink,
    tracker: &mut UsageTracker,
) -> Termination {
    match shape {
        UpstreamShape::NativeStream => {
            let connected = tokio::select! {
                biased;
                _ = sink.closed() => None,
                connected = state.upstream.call_streaming(&upstream) => Some(connected),
            };
            match connected {
                None => Termination::Cancelled,
                Some(Ok(chunks)) => relay_native_stream(chunks, sink, tracker).await,
                Some(Err(e)) => emit_stream_error(sink, tracker, e.envelope()).await,
            }
        }
        UpstreamShape::Buffered => {
            let client = state.upstream.clone();
            let call = async move { client.call_buffered(&upstream).await };
            state.heartbeat.run(call, sink, tracker).await
        }
    }
}

/// Report a request refused after the stream opened, in the stream's own
/// framing: an `error` event when buffered, a data line plus `[DONE]` when
/// native.
async fn refuse(
    shape: UpstreamShape,
    error: &Error,
    sink: &FrameSink,
    tracker: &mut UsageTracker,
) -> Termination {
    let envelope = error.envelope();
    tracker.observe(&envelope.to_value());

    let delivered = match shape {
        UpstreamShape::Buffered => sink.send(Frame::Error(envelope)).await,
        UpstreamShape::NativeStream => match sink.send(Frame::Data(envelope.to_value())).await {
            Ok(()) => sink.send(Frame::Done).await,
            Err(e) => Err(e),
        },
    };

    match delivered {
        Ok(()) => Termination::Rejected,
        Err(_) => Termination::Cancelled,
    }
}

/// Handle GET /health
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "relaygate"
    }))
}
