//! SSE usage tracking and native-stream relay.
//!
//! [`UsageTracker`] buffers raw bytes across chunk boundaries, reassembles
//! complete lines, and pulls token usage and error state out of `data:`
//! lines. [`relay_native_stream`] forwards an upstream byte stream to the
//! client while feeding every chunk through a tracker.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;

use super::normalize::{
    extract_code, extract_message, ErrorEnvelope, ErrorKind, DEFAULT_ERROR_CODE,
};
use super::session::Termination;
use super::sse::{Disconnected, Frame, FrameSink};

/// A partial line longer than this is discarded rather than buffered forever.
const MAX_PENDING_LINE: usize = 8 * 1024 * 1024;

/// Token counts reported by one upstream usage object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Upstream-declared total, when it sent one.
    pub total_tokens: Option<u64>,
}

type UsageExtractor = fn(&Value) -> Option<TokenUsage>;

/// Recognised usage shapes, tried in order.
const USAGE_CHAIN: [UsageExtractor; 3] = [gemini_usage, openai_usage, anthropic_usage];

/// Pull token usage from a payload, if it carries any recognised shape.
pub fn extract_usage(payload: &Value) -> Option<TokenUsage> {
    USAGE_CHAIN.iter().find_map(|extract| extract(payload))
}

/// `{"usageMetadata": {"promptTokenCount", "thoughtsTokenCount", "candidatesTokenCount", "totalTokenCount"}}`
fn gemini_usage(payload: &Value) -> Option<TokenUsage> {
    let usage = payload.get("usageMetadata")?.as_object()?;
    let prompt = count(usage.get("promptTokenCount"));
    let thoughts = count(usage.get("thoughtsTokenCount"));
    let candidates = count(usage.get("candidatesTokenCount"));
    Some(TokenUsage {
        input_tokens: prompt.saturating_add(thoughts),
        output_tokens: candidates,
        total_tokens: declared(usage.get("totalTokenCount")),
    })
}

/// `{"usage": {"prompt_tokens", "completion_tokens", "total_tokens"}}`
fn openai_usage(payload: &Value) -> Option<TokenUsage> {
    let usage = payload.get("usage")?.as_object()?;
    if !usage.contains_key("prompt_tokens") && !usage.contains_key("completion_tokens") {
        return None;
    }
    Some(TokenUsage {
        input_tokens: count(usage.get("prompt_tokens")),
        output_tokens: count(usage.get("completion_tokens")),
        total_tokens: declared(usage.get("total_tokens")),
    })
}

/// `{"usage": {"input_tokens", "output_tokens"}}`
fn anthropic_usage(payload: &Value) -> Option<TokenUsage> {
    let usage = payload.get("usage")?.as_object()?;
    if !usage.contains_key("input_tokens") && !usage.contains_key("output_tokens") {
        return None;
    }
    Some(TokenUsage {
        input_tokens: count(usage.get("input_tokens")),
        output_tokens: count(usage.get("output_tokens")),
        total_tokens: None,
    })
}

/// Non-negative token count; missing or malformed values count as zero.
fn count(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f > 0.0).map(|f| f as u64))
            .unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse::<u64>().unwrap_or(0),
        _ => 0,
    }
}

/// A declared total of zero is treated as absent.
fn declared(value: Option<&Value>) -> Option<u64> {
    Some(count(value)).filter(|total| *total > 0)
}

/// Final per-request usage figures, read once at record time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageSummary {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub success: bool,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
}

/// Incremental usage/error accumulator for one request.
///
/// `success` only ever goes from true to false. `status_code` and
/// `error_message` are independently first-write-wins.
#[derive(Debug)]
pub struct UsageTracker {
    buffer: Vec<u8>,
    input_tokens: u64,
    output_tokens: u64,
    total_tokens: u64,
    success: bool,
    status_code: Option<u16>,
    error_message: Option<String>,
    seen_usage: bool,
    done_received: bool,
}

impl Default for UsageTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageTracker {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            success: true,
            status_code: None,
            error_message: None,
            seen_usage: false,
            done_received: false,
        }
    }

    /// Feed a chunk of SSE bytes in arrival order.
    ///
    /// Unparseable and non-object `data:` lines are protocol noise and are
    /// skipped silently.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);

        let mut consumed = 0;
        while let Some(pos) = self.buffer[consumed..].iter().position(|b| *b == b'\n') {
            let end = consumed + pos;
            let line = String::from_utf8_lossy(&self.buffer[consumed..end]).into_owned();
            consumed = end + 1;
            self.process_line(&line);
        }
        self.buffer.drain(..consumed);

        if self.buffer.len() > MAX_PENDING_LINE {
            tracing::warn!(
                pending_bytes = self.buffer.len(),
                "Discarding oversized partial SSE line"
            );
            self.buffer.clear();
        }
    }

    fn process_line(&mut self, line: &str) {
        let Some(data) = line.trim().strip_prefix("data:") else {
            return;
        };
        let data = data.trim();
        if data.is_empty() {
            return;
        }
        if data == "[DONE]" {
            self.done_received = true;
            return;
        }
        if let Ok(payload) = serde_json::from_str::<Value>(data) {
            self.observe(&payload);
        }
    }

    /// Apply one already-parsed payload. Non-objects are ignored.
    pub fn observe(&mut self, payload: &Value) {
        if !payload.is_object() {
            return;
        }

        if payload.get("error").is_some_and(|e| !e.is_null()) {
            self.success = false;
            if self.error_message.is_none() {
                self.error_message = Some(extract_message(payload).1);
            }
            if self.status_code.is_none() {
                self.status_code = Some(extract_code(payload).unwrap_or(DEFAULT_ERROR_CODE));
            }
        }

        // Upstream figures are cumulative; later objects replace earlier ones.
        if let Some(usage) = extract_usage(payload) {
            self.input_tokens = usage.input_tokens;
            self.output_tokens = usage.output_tokens;
            self.total_tokens = usage
                .total_tokens
                .unwrap_or(usage.input_tokens.saturating_add(usage.output_tokens));
            self.seen_usage = true;
        }
    }

    /// Mark the request failed for a reason that never appeared in the stream.
    pub fn record_failure(&mut self, status_code: u16, message: impl Into<String>) {
        self.success = false;
        self.status_code.get_or_insert(status_code);
        if self.error_message.is_none() {
            self.error_message = Some(message.into());
        }
    }

    /// Settle `total_tokens` when no usage object was ever seen.
    pub fn finalize(&mut self) {
        if !self.seen_usage && self.total_tokens == 0 {
            self.total_tokens = self.input_tokens.saturating_add(self.output_tokens);
        }
    }

    pub fn summary(&self) -> UsageSummary {
        UsageSummary {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            total_tokens: self.total_tokens,
            success: self.success,
            status_code: self.status_code,
            error_message: self.error_message.clone(),
        }
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn seen_usage(&self) -> bool {
        self.seen_usage
    }

    /// Whether `data: [DONE]` has been seen.
    pub fn done_received(&self) -> bool {
        self.done_received
    }

    /// Whether bytes after the last newline are still waiting for completion.
    pub fn has_pending_line(&self) -> bool {
        !self.buffer.is_empty()
    }
}

/// Newlines at the end of the bytes forwarded so far, capped at two.
///
/// Starts at an event boundary, so nothing is owed before the first frame.
#[derive(Debug, Clone, Copy)]
struct EventTail {
    newlines: u8,
}

impl Default for EventTail {
    fn default() -> Self {
        Self { newlines: 2 }
    }
}

impl EventTail {
    fn advance(&mut self, bytes: &[u8]) {
        let mut trailing = 0u8;
        for byte in bytes.iter().rev() {
            match byte {
                b'\n' => trailing += 1,
                b'\r' => {}
                _ => {
                    self.newlines = trailing;
                    return;
                }
            }
            if trailing >= 2 {
                self.newlines = 2;
                return;
            }
        }
        self.newlines = self.newlines.saturating_add(trailing).min(2);
    }

    /// Bytes that close the current event, if it is still open.
    fn boundary(&self) -> &'static [u8] {
        match self.newlines {
            0 => b"\n\n",
            1 => b"\n",
            _ => b"",
        }
    }
}

/// Close a half-forwarded upstream event so the next frame stands alone.
///
/// The closing bytes go through the tracker too, so it sees the same events
/// the client does.
async fn close_event(
    sink: &FrameSink,
    tracker: &mut UsageTracker,
    tail: &mut EventTail,
) -> Result<(), Disconnected> {
    let boundary = tail.boundary();
    if boundary.is_empty() {
        return Ok(());
    }
    tracker.feed(boundary);
    tail.advance(boundary);
    sink.send(Frame::Raw(Bytes::from_static(boundary))).await
}

/// Forward a native upstream stream to the client, tracking usage as it goes.
///
/// Ends with `data: [DONE]` even when the upstream did not send one. A
/// transport failure mid-body becomes an `internal_error` data line.
pub async fn relay_native_stream<S, E>(
    chunks: S,
    sink: &FrameSink,
    tracker: &mut UsageTracker,
) -> Termination
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    let mut chunks = std::pin::pin!(chunks);
    let mut tail = EventTail::default();

    loop {
        let next = tokio::select! {
            biased;
            _ = sink.closed() => return Termination::Cancelled,
            next = chunks.next() => next,
        };

        match next {
            Some(Ok(bytes)) => {
                if bytes.is_empty() {
                    continue;
                }
                tracker.feed(&bytes);
                tail.advance(&bytes);
                if sink.send(Frame::Raw(bytes)).await.is_err() {
                    return Termination::Cancelled;
                }
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "Upstream stream failed mid-body");
                let envelope =
                    ErrorEnvelope::new(ErrorKind::Internal, e.to_string(), DEFAULT_ERROR_CODE);
                if close_event(sink, tracker, &mut tail).await.is_err() {
                    return Termination::Cancelled;
                }
                return emit_stream_error(sink, tracker, envelope).await;
            }
            None => break,
        }
    }

    if close_event(sink, tracker, &mut tail).await.is_err() {
        return Termination::Cancelled;
    }
    if !tracker.done_received() && sink.send(Frame::Done).await.is_err() {
        return Termination::Cancelled;
    }

    if tracker.success() {
        Termination::Completed
    } else {
        Termination::UpstreamError
    }
}

/// Close a passthrough stream with an error data line and `[DONE]`.
///
/// The envelope is fed through the tracker so the usage record carries the
/// same status and message the client saw.
pub async fn emit_stream_error(
    sink: &FrameSink,
    tracker: &mut UsageTracker,
    envelope: ErrorEnvelope,
) -> Termination {
    let payload = envelope.to_value();
    tracker.observe(&payload);

    let termination = match envelope.error.kind {
        ErrorKind::Upstream => Termination::UpstreamError,
        _ => Termination::InternalError,
    };

    // Terminate any half-forwarded upstream line so the error is its own event.
    if tracker.has_pending_line()
        && sink
            .send(Frame::Raw(Bytes::from_static(b"\n\n")))
            .await
            .is_err()
    {
        return Termination::Cancelled;
    }
    if sink.send(Frame::Data(payload)).await.is_err() || sink.send(Frame::Done).await.is_err() {
        return Termination::Cancelled;
    }
    termination
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::sse;

    /// Build SSE data from event lines, then split at the given byte positions.
    fn split_sse_at_positions(events: &[&str], split_positions: &[usize]) -> Vec<Vec<u8>> {
        let full: Vec<u8> = events
            .iter()
            .flat_map(|e| format!("{}\n\n", e).into_bytes())
            .collect();

        let mut chunks = Vec::new();
        let mut prev = 0;
        for &pos in split_positions {
            if pos > prev && pos < full.len() {
                chunks.push(full[prev..pos].to_vec());
                prev = pos;
            }
        }
        chunks.push(full[prev..].to_vec());
        chunks
    }

    fn tracked(chunks: &[Vec<u8>]) -> UsageTracker {
        let mut tracker = UsageTracker::new();
        for chunk in chunks {
            tracker.feed(chunk);
        }
        tracker.finalize();
        tracker
    }

    #[test]
    fn usage_metadata_with_declared_total() {
        let events = [
            r#"data: {"usageMetadata":{"promptTokenCount":10,"candidatesTokenCount":5,"totalTokenCount":15}}"#,
        ];
        let summary = tracked(&split_sse_at_positions(&events, &[])).summary();

        assert_eq!(summary.input_tokens, 10);
        assert_eq!(summary.output_tokens, 5);
        assert_eq!(summary.total_tokens, 15);
        assert!(summary.success);
        assert_eq!(summary.status_code, None);
    }

    #[test]
    fn nested_error_object_sets_failure() {
        let events = [r#"data: {"error":{"message":"quota exceeded","code":429}}"#];
        let summary = tracked(&split_sse_at_positions(&events, &[])).summary();

        assert!(!summary.success);
        assert_eq!(summary.status_code, Some(429));
        assert_eq!(summary.error_message.as_deref(), Some("quota exceeded"));
    }

    #[test]
    fn first_error_message_wins() {
        let events = [r#"data: {"error":"A"}"#, r#"data: {"error":"B"}"#];
        let summary = tracked(&split_sse_at_positions(&events, &[])).summary();

        assert_eq!(summary.error_message.as_deref(), Some("A"));
        assert_eq!(summary.status_code, Some(500));
    }

    #[test]
    fn empty_stream_totals_zero() {
        let mut tracker = UsageTracker::new();
        tracker.finalize();
        let summary = tracker.summary();

        assert_eq!(summary.total_tokens, 0);
        assert!(summary.success);
        assert!(!tracker.seen_usage());
    }

    #[test]
    fn usage_split_across_chunks() {
        let events = [
            r#"data: {"candidates":[{"content":{"parts":[{"text":"Hi"}]}}]}"#,
            r#"data: {"candidates":[],"usageMetadata":{"promptTokenCount":7,"thoughtsTokenCount":3,"candidatesTokenCount":4,"totalTokenCount":14}}"#,
        ];
        let chunks = split_sse_at_positions(&events, &[20, 90, 130, 150]);
        assert!(chunks.len() > 1);

        let summary = tracked(&chunks).summary();
        assert_eq!(summary.input_tokens, 10);
        assert_eq!(summary.output_tokens, 4);
        assert_eq!(summary.total_tokens, 14);
    }

    #[test]
    fn missing_total_is_input_plus_output() {
        let events = [
            r#"data: {"usageMetadata":{"promptTokenCount":6,"thoughtsTokenCount":2,"candidatesTokenCount":9}}"#,
        ];
        let summary = tracked(&split_sse_at_positions(&events, &[])).summary();
        assert_eq!(summary.total_tokens, 17);
    }

    #[test]
    fn later_usage_overwrites_earlier() {
        let events = [
            r#"data: {"usageMetadata":{"promptTokenCount":5,"candidatesTokenCount":1,"totalTokenCount":6}}"#,
            r#"data: {"usageMetadata":{"promptTokenCount":5,"candidatesTokenCount":20,"totalTokenCount":25}}"#,
        ];
        let summary = tracked(&split_sse_at_positions(&events, &[])).summary();
        assert_eq!(summary.output_tokens, 20);
        assert_eq!(summary.total_tokens, 25);
    }

    #[test]
    fn openai_and_anthropic_usage_shapes() {
        let events = [
            r#"data: {"choices":[],"usage":{"prompt_tokens":8,"completion_tokens":3,"total_tokens":11}}"#,
        ];
        let summary = tracked(&split_sse_at_positions(&events, &[])).summary();
        assert_eq!((summary.input_tokens, summary.output_tokens, summary.total_tokens), (8, 3, 11));

        let events = [r#"data: {"type":"message_delta","usage":{"input_tokens":4,"output_tokens":6}}"#];
        let summary = tracked(&split_sse_at_positions(&events, &[])).summary();
        assert_eq!((summary.input_tokens, summary.output_tokens, summary.total_tokens), (4, 6, 10));

        // OpenAI streams carry `"usage": null` on every content chunk.
        assert_eq!(extract_usage(&serde_json::json!({"usage": null})), None);
    }

    #[test]
    fn string_and_negative_counts() {
        let payload = serde_json::json!({
            "usageMetadata": {"promptTokenCount": "12", "candidatesTokenCount": -3}
        });
        assert_eq!(
            extract_usage(&payload),
            Some(TokenUsage {
                input_tokens: 12,
                output_tokens: 0,
                total_tokens: None
            })
        );
    }

    #[test]
    fn huge_counts_saturate_instead_of_overflowing() {
        let mut tracker = UsageTracker::new();
        tracker.feed(
            b"data: {\"usageMetadata\":{\"promptTokenCount\":18446744073709551615,\"thoughtsTokenCount\":1,\"candidatesTokenCount\":7}}\n",
        );
        tracker.finalize();
        let summary = tracker.summary();
        assert_eq!(summary.input_tokens, u64::MAX);
        assert_eq!(summary.output_tokens, 7);
        assert_eq!(summary.total_tokens, u64::MAX);

        let mut tracker = UsageTracker::new();
        tracker.observe(&serde_json::json!({
            "usage": {"input_tokens": u64::MAX, "output_tokens": u64::MAX}
        }));
        assert_eq!(tracker.summary().total_tokens, u64::MAX);
    }

    #[test]
    fn success_never_flips_back() {
        let events = [
            r#"data: {"error":{"message":"transient","code":503}}"#,
            r#"data: {"candidates":[],"usageMetadata":{"promptTokenCount":1,"candidatesTokenCount":1,"totalTokenCount":2}}"#,
            r#"data: {"error":null}"#,
        ];
        let summary = tracked(&split_sse_at_positions(&events, &[])).summary();
        assert!(!summary.success);
        assert_eq!(summary.status_code, Some(503));
        assert_eq!(summary.total_tokens, 2);
    }

    #[test]
    fn status_and_message_are_independent() {
        let mut tracker = UsageTracker::new();
        tracker.feed(b"data: {\"error\":{\"message\":\"first\",\"status\":\"UNAVAILABLE\"}}\n");
        tracker.feed(b"data: {\"error\":{\"message\":\"second\",\"code\":429}}\n");
        let summary = tracker.summary();
        assert_eq!(summary.error_message.as_deref(), Some("first"));
        assert_eq!(summary.status_code, Some(500));

        let mut tracker = UsageTracker::new();
        tracker.record_failure(499, "client disconnected");
        tracker.feed(b"data: {\"error\":{\"message\":\"late\",\"code\":429}}\n");
        let summary = tracker.summary();
        assert_eq!(summary.status_code, Some(499));
        assert_eq!(summary.error_message.as_deref(), Some("client disconnected"));
    }

    #[test]
    fn finalize_is_idempotent() {
        let mut tracker = UsageTracker::new();
        tracker.feed(b"data: {\"usage\":{\"input_tokens\":3,\"output_tokens\":4}}\n");
        tracker.finalize();
        let first = tracker.summary();
        tracker.finalize();
        assert_eq!(tracker.summary(), first);
        assert_eq!(first.total_tokens, 7);
    }

    #[test]
    fn noise_lines_skipped() {
        let raw = b"event: message\nid: 1\n: comment\ndata: {not json}\ndata: [1,2,3]\ndata: \"text\"\ndata:\n\ndata: {\"usageMetadata\":{\"promptTokenCount\":2,\"candidatesTokenCount\":2}}\n\n";
        let mut tracker = UsageTracker::new();
        tracker.feed(raw);
        tracker.finalize();
        let summary = tracker.summary();
        assert!(summary.success);
        assert_eq!(summary.total_tokens, 4);
    }

    #[test]
    fn crlf_and_no_space_after_colon() {
        let raw = b"data:{\"usageMetadata\":{\"promptTokenCount\":4,\"candidatesTokenCount\":2,\"totalTokenCount\":6}}\r\n\r\ndata:[DONE]\r\n\r\n";
        let mut tracker = UsageTracker::new();
        tracker.feed(raw);
        assert!(tracker.done_received());
        assert_eq!(tracker.summary().total_tokens, 6);
    }

    #[test]
    fn unterminated_line_waits_for_newline() {
        let mut tracker = UsageTracker::new();
        tracker.feed(b"data: {\"error\":\"late\"}");
        assert!(tracker.success());
        assert!(tracker.has_pending_line());

        tracker.feed(b"\n");
        assert!(!tracker.success());
        assert!(!tracker.has_pending_line());
    }

    #[test]
    fn multibyte_character_split_across_chunks() {
        let line = "data: {\"error\":\"配额已用尽\"}\n".as_bytes().to_vec();
        // Split inside the first multibyte character.
        let cut = line.iter().position(|b| *b >= 0x80).unwrap() + 1;

        let mut tracker = UsageTracker::new();
        tracker.feed(&line[..cut]);
        tracker.feed(&line[cut..]);
        assert_eq!(tracker.summary().error_message.as_deref(), Some("配额已用尽"));
    }

    #[test]
    fn invalid_utf8_is_replaced_not_fatal() {
        let mut tracker = UsageTracker::new();
        tracker.feed(b"data: {\"error\":\"bad \xff byte\"}\n");
        let message = tracker.summary().error_message.unwrap();
        assert!(message.starts_with("bad "));
        assert!(message.contains('\u{FFFD}'));
    }

    #[test]
    fn oversized_partial_line_is_discarded() {
        let mut tracker = UsageTracker::new();
        tracker.feed(&vec![b'x'; MAX_PENDING_LINE + 1]);
        assert!(!tracker.has_pending_line());

        tracker.feed(b"data: {\"usageMetadata\":{\"promptTokenCount\":1,\"candidatesTokenCount\":1}}\n");
        assert_eq!(tracker.summary().input_tokens, 1);
    }

    /// Drain everything the sink produced once the producer side is gone.
    async fn collect(frames: tokio_stream::wrappers::ReceiverStream<Bytes>) -> String {
        let parts: Vec<Bytes> = frames.collect().await;
        parts
            .iter()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect()
    }

    #[tokio::test]
    async fn relay_passes_bytes_and_appends_done() {
        let upstream = futures::stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"data: {\"candidates\":[]}\n\n")),
            Ok(Bytes::from_static(
                b"data: {\"usageMetadata\":{\"promptTokenCount\":3,\"candidatesTokenCount\":2,\"totalTokenCount\":5}}\n\n",
            )),
        ]);
        let (sink, frames) = sse::channel();
        let mut tracker = UsageTracker::new();

        let termination = relay_native_stream(upstream, &sink, &mut tracker).await;
        drop(sink);

        assert_eq!(termination, Termination::Completed);
        assert_eq!(tracker.summary().total_tokens, 5);
        let body = collect(frames).await;
        assert!(body.starts_with("data: {\"candidates\":[]}\n\n"));
        assert!(body.ends_with("data: [DONE]\n\n"));
        assert_eq!(body.matches("[DONE]").count(), 1);
    }

    #[tokio::test]
    async fn relay_closes_unterminated_last_event_before_done() {
        let upstream = futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(
            b"data: {\"usageMetadata\":{\"promptTokenCount\":3,\"candidatesTokenCount\":2}}",
        ))]);
        let (sink, frames) = sse::channel();
        let mut tracker = UsageTracker::new();

        let termination = relay_native_stream(upstream, &sink, &mut tracker).await;
        drop(sink);

        assert_eq!(termination, Termination::Completed);
        assert_eq!(
            collect(frames).await,
            "data: {\"usageMetadata\":{\"promptTokenCount\":3,\"candidatesTokenCount\":2}}\n\ndata: [DONE]\n\n"
        );
        assert_eq!(tracker.summary().total_tokens, 5);
    }

    #[tokio::test]
    async fn relay_finishes_half_closed_event_and_unterminated_done() {
        let upstream = futures::stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"data: {\"x\":1}\r\n")),
            Ok(Bytes::from_static(b"\r\ndata: {\"x\":2}\n")),
        ]);
        let (sink, frames) = sse::channel();
        let mut tracker = UsageTracker::new();
        relay_native_stream(upstream, &sink, &mut tracker).await;
        drop(sink);
        assert_eq!(
            collect(frames).await,
            "data: {\"x\":1}\r\n\r\ndata: {\"x\":2}\n\ndata: [DONE]\n\n"
        );

        let upstream = futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(
            b"data: {\"x\":1}\n\ndata: [DONE]",
        ))]);
        let (sink, frames) = sse::channel();
        let mut tracker = UsageTracker::new();
        relay_native_stream(upstream, &sink, &mut tracker).await;
        drop(sink);
        assert!(tracker.done_received());
        assert_eq!(collect(frames).await, "data: {\"x\":1}\n\ndata: [DONE]\n\n");
    }

    #[tokio::test]
    async fn relay_does_not_duplicate_upstream_done() {
        let upstream = futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(
            b"data: {\"x\":1}\n\ndata: [DONE]\n\n",
        ))]);
        let (sink, frames) = sse::channel();
        let mut tracker = UsageTracker::new();

        relay_native_stream(upstream, &sink, &mut tracker).await;
        drop(sink);

        assert_eq!(collect(frames).await.matches("[DONE]").count(), 1);
    }

    #[tokio::test]
    async fn relay_reports_in_band_errors() {
        let upstream = futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(
            b"data: {\"error\":{\"message\":\"blocked\",\"code\":400}}\n\n",
        ))]);
        let (sink, _frames) = sse::channel();
        let mut tracker = UsageTracker::new();

        let termination = relay_native_stream(upstream, &sink, &mut tracker).await;
        assert_eq!(termination, Termination::UpstreamError);
        assert_eq!(tracker.summary().status_code, Some(400));
    }

    #[tokio::test]
    async fn relay_turns_transport_failure_into_internal_error() {
        let upstream = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"data: {\"partial\"")),
            Err(std::io::Error::other("connection reset")),
        ]);
        let (sink, frames) = sse::channel();
        let mut tracker = UsageTracker::new();

        let termination = relay_native_stream(upstream, &sink, &mut tracker).await;
        drop(sink);

        assert_eq!(termination, Termination::InternalError);
        let summary = tracker.summary();
        assert!(!summary.success);
        assert_eq!(summary.status_code, Some(500));
        assert_eq!(summary.error_message.as_deref(), Some("connection reset"));

        let body = collect(frames).await;
        assert!(body.contains("data: {\"partial\"\n\ndata: {\"error\""));
        assert!(body.contains(r#""type":"internal_error""#));
        assert!(body.ends_with("data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn relay_stops_when_client_leaves() {
        let upstream = futures::stream::pending::<Result<Bytes, std::io::Error>>();
        let (sink, frames) = sse::channel();
        drop(frames);
        let mut tracker = UsageTracker::new();

        let termination = relay_native_stream(upstream, &sink, &mut tracker).await;
        assert_eq!(termination, Termination::Cancelled);
    }

    #[tokio::test]
    async fn stream_error_envelope_is_tracked() {
        let (sink, frames) = sse::channel();
        let mut tracker = UsageTracker::new();
        let envelope = ErrorEnvelope::new(ErrorKind::Upstream, "rate limited", 429);

        let termination = emit_stream_error(&sink, &mut tracker, envelope).await;
        drop(sink);

        assert_eq!(termination, Termination::UpstreamError);
        assert_eq!(tracker.summary().status_code, Some(429));
        assert_eq!(tracker.summary().error_message.as_deref(), Some("rate limited"));
        let body = collect(frames).await;
        let (event, done) = body.split_once("\n\n").unwrap();
        let payload: Value = serde_json::from_str(event.strip_prefix("data: ").unwrap()).unwrap();
        assert_eq!(payload["error"]["type"], "upstream_error");
        assert_eq!(payload["error"]["code"], 429);
        assert_eq!(done, "data: [DONE]\n\n");
    }
}
