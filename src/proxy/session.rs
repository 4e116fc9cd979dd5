//! Per-request session state and the single terminal usage record.

use std::time::Instant;

use super::stream::UsageTracker;
use crate::storage::{UsageLogSink, UsageRecord};

/// Status recorded when the client abandons the request (nginx convention).
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

/// How a session's stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Result delivered (buffered) or upstream stream drained without error.
    Completed,
    /// Upstream reported an error, via HTTP status or in-band.
    UpstreamError,
    /// The gateway itself failed (transport, decode, task failure).
    InternalError,
    /// The client disconnected before the session finished.
    Cancelled,
    /// Refused before any upstream call (no credential, bad request).
    Rejected,
}

impl Termination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Termination::Completed => "completed",
            Termination::UpstreamError => "upstream_error",
            Termination::InternalError => "internal_error",
            Termination::Cancelled => "cancelled",
            Termination::Rejected => "rejected",
        }
    }
}

/// One inbound generation request.
///
/// Owned by the request task. [`StreamSession::finish`] consumes it, so the
/// usage record is written at most once.
#[derive(Debug)]
pub struct StreamSession {
    pub correlation_id: String,
    pub caller_id: String,
    pub endpoint: String,
    pub model: String,
    pub config_type: Option<String>,
    pub streaming: bool,
    started: Instant,
}

impl StreamSession {
    pub fn new(
        correlation_id: impl Into<String>,
        caller_id: impl Into<String>,
        endpoint: impl Into<String>,
        model: impl Into<String>,
        config_type: Option<String>,
        streaming: bool,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            caller_id: caller_id.into(),
            endpoint: endpoint.into(),
            model: model.into(),
            config_type,
            streaming,
            started: Instant::now(),
        }
    }

    /// Finalize the tracker and write the usage record.
    ///
    /// A sink failure is logged and swallowed: the client response is
    /// already committed by the time this runs.
    pub async fn finish(
        self,
        mut tracker: UsageTracker,
        termination: Termination,
        sink: &dyn UsageLogSink,
    ) -> UsageRecord {
        if termination == Termination::Cancelled {
            tracker.record_failure(CLIENT_CLOSED_REQUEST, "client disconnected");
        }
        tracker.finalize();

        let record = self.into_record(&tracker);

        match sink.record(&record).await {
            Ok(()) => tracing::debug!(
                correlation_id = %record.correlation_id,
                termination = termination.as_str(),
                total_tokens = record.total_tokens,
                "Usage record written"
            ),
            Err(e) => tracing::warn!(
                correlation_id = %record.correlation_id,
                termination = termination.as_str(),
                error = %e,
                "Failed to write usage record"
            ),
        }

        record
    }

    /// Record a request refused before any upstream call.
    pub async fn reject(
        self,
        status_code: u16,
        message: impl Into<String>,
        sink: &dyn UsageLogSink,
    ) -> UsageRecord {
        let mut tracker = UsageTracker::new();
        tracker.record_failure(status_code, message);
        self.finish(tracker, Termination::Rejected, sink).await
    }

    fn into_record(self, tracker: &UsageTracker) -> UsageRecord {
        let summary = tracker.summary();
        UsageRecord {
            correlation_id: self.correlation_id,
            timestamp: chrono::Utc::now().to_rfc3339(),
            caller_id: self.caller_id,
            endpoint: self.endpoint,
            model: self.model,
            config_type: self.config_type,
            streaming: self.streaming,
            input_tokens: summary.input_tokens,
            output_tokens: summary.output_tokens,
            total_tokens: summary.total_tokens,
            success: summary.success,
            status_code: summary.status_code,
            error_message: summary.error_message,
            duration_ms: self.started.elapsed().as_millis() as i64,
        }
    }
}
