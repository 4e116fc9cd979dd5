//! Outbound SSE framing.
//!
//! Frames are produced by a per-request task and handed to the response body
//! through a bounded channel. The receiving half is the HTTP body, so a client
//! disconnect shows up on the producing side as a closed [`FrameSink`].

use std::convert::Infallible;

use axum::{
    body::Body,
    http::{header, HeaderValue, StatusCode},
    response::Response,
};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::normalize::ErrorEnvelope;

/// Frames buffered between the producer task and the HTTP body.
pub const FRAME_BUFFER: usize = 32;

const HEARTBEAT_FRAME: &str = "event: heartbeat\ndata: {\"status\":\"still generating\"}\n\n";
const DONE_FRAME: &str = "data: [DONE]\n\n";

/// One unit of client-facing SSE output.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// `event: heartbeat` keep-alive while a buffered call is outstanding.
    Heartbeat,
    /// `event: result` carrying the full upstream payload.
    Result(Value),
    /// `event: error` carrying a normalized envelope.
    Error(ErrorEnvelope),
    /// Bare `data:` line, used on the passthrough path.
    Data(Value),
    /// Upstream bytes forwarded untouched.
    Raw(Bytes),
    /// `data: [DONE]`
    Done,
}

impl Frame {
    pub fn encode(&self) -> Bytes {
        match self {
            Frame::Heartbeat => Bytes::from_static(HEARTBEAT_FRAME.as_bytes()),
            Frame::Result(payload) => Bytes::from(format!("event: result\ndata: {}\n\n", payload)),
            Frame::Error(envelope) => {
                Bytes::from(format!("event: error\ndata: {}\n\n", envelope.to_value()))
            }
            Frame::Data(payload) => Bytes::from(format!("data: {}\n\n", payload)),
            Frame::Raw(bytes) => bytes.clone(),
            Frame::Done => Bytes::from_static(DONE_FRAME.as_bytes()),
        }
    }
}

/// The client went away; nothing further can be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("client disconnected")]
pub struct Disconnected;

/// Producer half of a client SSE stream.
#[derive(Debug, Clone)]
pub struct FrameSink {
    tx: mpsc::Sender<Bytes>,
}

impl FrameSink {
    pub async fn send(&self, frame: Frame) -> Result<(), Disconnected> {
        self.tx.send(frame.encode()).await.map_err(|_| Disconnected)
    }

    /// Resolves once the client side has been dropped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Create a linked sink and body stream.
pub fn channel() -> (FrameSink, ReceiverStream<Bytes>) {
    let (tx, rx) = mpsc::channel(FRAME_BUFFER);
    (FrameSink { tx }, ReceiverStream::new(rx))
}

/// Wrap a frame stream in a `text/event-stream` response with the
/// anti-buffering headers proxies need to pass events through promptly.
pub fn sse_response(frames: ReceiverStream<Bytes>) -> Response {
    let body = Body::from_stream(frames.map(Ok::<_, Infallible>));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}
