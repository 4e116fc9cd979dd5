//! Heartbeat multiplexing for upstream calls that cannot stream.
//!
//! The buffered call runs as its own task. The request task waits on it with
//! a timeout; a timeout only means "send a heartbeat and keep waiting", the
//! call itself is never disturbed by it. A client disconnect cancels the call
//! through a [`CancellationToken`] and the teardown is awaited before
//! [`Termination::Cancelled`] is returned to the caller.

use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use super::normalize::{ErrorEnvelope, ErrorKind, DEFAULT_ERROR_CODE};
use super::session::Termination;
use super::sse::{Frame, FrameSink};
use super::stream::UsageTracker;
use super::transport::TransportError;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// `Waiting` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    Waiting,
    Completed,
    Errored,
    Cancelled,
}

impl HeartbeatState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, HeartbeatState::Waiting)
    }

    fn termination(self, error_kind: Option<ErrorKind>) -> Termination {
        match (self, error_kind) {
            (HeartbeatState::Cancelled, _) => Termination::Cancelled,
            (_, Some(ErrorKind::Upstream)) => Termination::UpstreamError,
            (HeartbeatState::Completed, _) => Termination::Completed,
            _ => Termination::InternalError,
        }
    }
}

type CallOutcome = Option<Result<Value, TransportError>>;

enum Wake {
    Joined(Result<CallOutcome, JoinError>),
    Tick,
    ClientGone,
}

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatMultiplexer {
    interval: Duration,
}

impl Default for HeartbeatMultiplexer {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_INTERVAL)
    }
}

impl HeartbeatMultiplexer {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Drive one buffered call to a terminal frame.
    ///
    /// Emits a heartbeat every `interval` while the call is outstanding, then
    /// exactly one `result` or `error` frame. Nothing is emitted once the
    /// client has gone.
    pub async fn run<F>(&self, call: F, sink: &FrameSink, tracker: &mut UsageTracker) -> Termination
    where
        F: Future<Output = Result<Value, TransportError>> + Send + 'static,
    {
        let token = CancellationToken::new();
        let mut task = spawn_call(call, token.child_token());
        let mut heartbeats = 0u32;

        let joined = loop {
            let wake = tokio::select! {
                biased;
                _ = sink.closed() => Wake::ClientGone,
                joined = tokio::time::timeout(self.interval, &mut task) => match joined {
                    Ok(joined) => Wake::Joined(joined),
                    Err(_) => Wake::Tick,
                },
            };

            match wake {
                Wake::Joined(joined) => break joined,
                Wake::Tick => {
                    if sink.send(Frame::Heartbeat).await.is_err() {
                        return cancel(token, task, heartbeats).await;
                    }
                    heartbeats += 1;
                    tracing::debug!(heartbeats, "Upstream still generating");
                }
                Wake::ClientGone => return cancel(token, task, heartbeats).await,
            }
        };

        let (state, frame, error_kind) = match joined {
            Ok(Some(Ok(payload))) => {
                tracker.observe(&payload);
                // A 200 can still carry an in-band error object.
                let kind = (!tracker.success()).then_some(ErrorKind::Upstream);
                (HeartbeatState::Completed, Frame::Result(payload), kind)
            }
            Ok(Some(Err(e))) => {
                let envelope = e.envelope();
                tracker.observe(&envelope.to_value());
                let kind = envelope.error.kind;
                (HeartbeatState::Errored, Frame::Error(envelope), Some(kind))
            }
            // Only the token can produce this, and it has not been cancelled.
            Ok(None) => return HeartbeatState::Cancelled.termination(None),
            Err(e) => {
                tracing::error!(error = %e, "Buffered upstream task failed");
                let envelope = ErrorEnvelope::new(
                    ErrorKind::Internal,
                    "upstream task failed",
                    DEFAULT_ERROR_CODE,
                );
                tracker.observe(&envelope.to_value());
                (HeartbeatState::Errored, Frame::Error(envelope), Some(ErrorKind::Internal))
            }
        };

        tracing::debug!(state = ?state, heartbeats, "Buffered upstream call finished");

        if sink.send(frame).await.is_err() {
            return Termination::Cancelled;
        }
        state.termination(error_kind)
    }
}

fn spawn_call<F>(call: F, token: CancellationToken) -> JoinHandle<CallOutcome>
where
    F: Future<Output = Result<Value, TransportError>> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = token.cancelled() => None,
            outcome = call => Some(outcome),
        }
    })
}

async fn cancel(
    token: CancellationToken,
    task: JoinHandle<CallOutcome>,
    heartbeats: u32,
) -> Termination {
    token.cancel();
    if let Err(e) = task.await {
        tracing::warn!(error = %e, "Buffered upstream task did not shut down cleanly");
    }
    tracing::info!(heartbeats, "Client disconnected, upstream call cancelled");
    HeartbeatState::Cancelled.termination(None)
}
