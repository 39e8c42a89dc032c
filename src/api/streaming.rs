//! Server-Sent Events (SSE) normalisation for streaming chat completions.
//!
//! An upstream event stream is parsed line by line into [`DeltaEvent`]s and
//! re-encoded in one canonical `chat.completion.chunk` format, whichever
//! provider produced it. The transform runs as a small state machine
//! (`Start -> Streaming -> Finished`) under three independent time bounds:
//! a per-read timeout, an inactivity timeout and a total-duration timeout.
//!
//! The upstream body is dropped on every exit path, which closes the
//! upstream connection.

use crate::api::disconnect::DisconnectStream;
use crate::api::models::{completion_id, ProviderKind, StreamChunk};
use crate::core::cancel::StreamCancelHandle;
use crate::core::config::StreamConfig;
use crate::core::logging::get_request_id;
use crate::core::metrics::get_metrics;
use crate::core::redact::{redact_sensitive, truncate_chars};
use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

/// Content deltas longer than this are truncated.
pub const MAX_CONTENT_CHARS: usize = 4096;

/// Hard ceiling on upstream chunks read per stream.
pub const MAX_CHUNKS: usize = 10_000;

const DONE_SENTINEL: &str = "[DONE]";

/// Internal representation of one outgoing stream event.
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaEvent {
    /// Sent first, before any upstream bytes arrive.
    Meta { model: String },
    Content { text: String },
    /// Normal completion. Followed by the canonical terminator.
    Done,
    /// Terminal failure; carries the caller-safe message only.
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StreamError {
    #[error("stream exceeded total duration of {0:?}")]
    TotalTimeout(Duration),

    #[error("no upstream data for {0:?}")]
    Inactivity(Duration),

    #[error("stream exceeded {0} upstream chunks")]
    ChunkLimit(usize),

    #[error("upstream stream failed: {0}")]
    Upstream(String),
}

impl StreamError {
    pub fn public_message(&self) -> &'static str {
        match self {
            StreamError::TotalTimeout(_) | StreamError::Inactivity(_) => "Request timeout",
            StreamError::ChunkLimit(_) => "Stream aborted",
            StreamError::Upstream(_) => "Service unavailable",
        }
    }

    fn outcome(&self) -> &'static str {
        match self {
            StreamError::TotalTimeout(_) => "total_timeout",
            StreamError::Inactivity(_) => "inactivity_timeout",
            StreamError::ChunkLimit(_) => "chunk_limit",
            StreamError::Upstream(_) => "upstream_error",
        }
    }
}

/// Bounds applied to one streaming transform.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub total_timeout: Duration,
    pub inactivity_timeout: Duration,
    pub read_timeout: Duration,
    /// Larger upstream chunks are truncated; the line buffer is capped at
    /// four times this value.
    pub max_chunk_size: usize,
    pub max_chunks: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            total_timeout: Duration::from_secs(60),
            inactivity_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(10),
            max_chunk_size: 8192,
            max_chunks: MAX_CHUNKS,
        }
    }
}

impl From<&StreamConfig> for StreamOptions {
    fn from(config: &StreamConfig) -> Self {
        Self {
            total_timeout: Duration::from_millis(config.total_timeout_ms),
            inactivity_timeout: Duration::from_millis(config.inactivity_timeout_ms),
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            max_chunk_size: config.max_chunk_size.max(1),
            max_chunks: MAX_CHUNKS,
        }
    }
}

/// Classification of one upstream line.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    /// Not a data line, or a data line without text.
    Ignored,
    /// The upstream's own end marker. Never re-emitted.
    Sentinel,
    Content(String),
    Malformed,
}

/// Parse one upstream SSE line. Both `data: x` and `data:x` are accepted.
///
/// Text is read from `response` (primary provider) or
/// `choices[0].delta.content` (OpenAI format).
pub fn parse_line(line: &str) -> ParsedLine {
    let line = line.trim_end_matches(['\r', '\n']);
    let Some(data) = line.strip_prefix("data:") else {
        return ParsedLine::Ignored;
    };
    let data = data.trim();
    if data == DONE_SENTINEL {
        return ParsedLine::Sentinel;
    }

    let value: Value = match serde_json::from_str(data) {
        Ok(value) => value,
        Err(_) => return ParsedLine::Malformed,
    };

    let text = value
        .get("response")
        .and_then(Value::as_str)
        .or_else(|| value.pointer("/choices/0/delta/content").and_then(Value::as_str));

    match text {
        Some(text) if !text.is_empty() => ParsedLine::Content(truncate_chars(text, MAX_CONTENT_CHARS)),
        _ => ParsedLine::Ignored,
    }
}

/// Encodes events as canonical SSE frames sharing one completion id.
#[derive(Debug, Clone)]
pub struct SseEncoder {
    id: String,
    model: String,
}

impl SseEncoder {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: completion_id(),
            model: model.into(),
        }
    }

    pub fn encode(&self, event: &DeltaEvent) -> Bytes {
        let frame = match event {
            DeltaEvent::Meta { model } => self.frame(StreamChunk::role(model)),
            DeltaEvent::Content { text } => self.frame(StreamChunk::content(&self.model, text)),
            DeltaEvent::Done => {
                let mut frame = self.frame(StreamChunk::stop(&self.model));
                frame.push_str("data: [DONE]\n\n");
                frame
            }
            DeltaEvent::Error { message } => {
                format!("data: {}\n\n", json!({ "error": { "message": message } }))
            }
        };
        Bytes::from(frame)
    }

    fn frame(&self, mut chunk: StreamChunk) -> String {
        chunk.id = self.id.clone();
        match serde_json::to_string(&chunk) {
            Ok(json) => format!("data: {}\n\n", json),
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize stream chunk");
                String::new()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Start,
    Streaming,
    Finished,
}

struct Transform<E> {
    upstream: Option<BoxStream<'static, Result<Bytes, E>>>,
    phase: Phase,
    model: String,
    provider: ProviderKind,
    request_id: String,
    options: StreamOptions,
    buffer: Vec<u8>,
    pending: VecDeque<DeltaEvent>,
    started: Instant,
    last_chunk: Instant,
    chunks: usize,
    cancel: StreamCancelHandle,
    cancel_rx: watch::Receiver<bool>,
}

impl<E: fmt::Display> Transform<E> {
    async fn next_event(&mut self) -> Option<DeltaEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            match self.phase {
                Phase::Finished => return None,
                Phase::Start => {
                    self.phase = Phase::Streaming;
                    return Some(DeltaEvent::Meta {
                        model: self.model.clone(),
                    });
                }
                Phase::Streaming => self.pump().await,
            }
        }
    }

    fn check_bounds(&self) -> Result<(), StreamError> {
        let now = Instant::now();
        if now.duration_since(self.started) >= self.options.total_timeout {
            return Err(StreamError::TotalTimeout(self.options.total_timeout));
        }
        if now.duration_since(self.last_chunk) >= self.options.inactivity_timeout {
            return Err(StreamError::Inactivity(self.options.inactivity_timeout));
        }
        if self.chunks > self.options.max_chunks {
            return Err(StreamError::ChunkLimit(self.options.max_chunks));
        }
        Ok(())
    }

    /// Longest wait for the next read that cannot overshoot any bound.
    fn next_wait(&self) -> Duration {
        let now = Instant::now();
        let total_left = self
            .options
            .total_timeout
            .saturating_sub(now.duration_since(self.started));
        let idle_left = self
            .options
            .inactivity_timeout
            .saturating_sub(now.duration_since(self.last_chunk));
        self.options.read_timeout.min(total_left).min(idle_left)
    }

    /// One read from the upstream. A read timeout only re-checks the bounds.
    async fn pump(&mut self) {
        if let Err(e) = self.check_bounds() {
            return self.fail(e);
        }
        let wait = self.next_wait();
        let Some(upstream) = self.upstream.as_mut() else {
            return self.complete();
        };

        let read = tokio::select! {
            biased;
            _ = cancelled(&mut self.cancel_rx) => None,
            read = tokio::time::timeout(wait, upstream.next()) => Some(read),
        };

        match read {
            None => self.abort(),
            Some(Err(_)) => {}
            Some(Ok(None)) => {
                self.flush_tail();
                self.complete();
            }
            Some(Ok(Some(Err(e)))) => {
                self.fail(StreamError::Upstream(redact_sensitive(&e.to_string())))
            }
            Some(Ok(Some(Ok(bytes)))) => self.ingest(&bytes),
        }
    }

    fn ingest(&mut self, bytes: &[u8]) {
        self.chunks += 1;
        self.last_chunk = Instant::now();

        let max = self.options.max_chunk_size;
        let bytes = if bytes.len() > max {
            tracing::debug!(
                request_id = %self.request_id,
                size = bytes.len(),
                limit = max,
                "Truncating oversized upstream chunk"
            );
            &bytes[..max]
        } else {
            bytes
        };
        self.buffer.extend_from_slice(bytes);

        if self.buffer.len() > max * 4 {
            let excess = self.buffer.len() - max * 2;
            self.buffer.drain(..excess);
        }

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.handle_line(&String::from_utf8_lossy(&line));
        }
    }

    fn flush_tail(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let tail = std::mem::take(&mut self.buffer);
        self.handle_line(&String::from_utf8_lossy(&tail));
    }

    fn handle_line(&mut self, line: &str) {
        match parse_line(line) {
            ParsedLine::Content(text) => self.pending.push_back(DeltaEvent::Content { text }),
            ParsedLine::Malformed => {
                get_metrics()
                    .stream_malformed_lines
                    .with_label_values(&[self.provider.as_str()])
                    .inc();
                tracing::debug!(
                    request_id = %self.request_id,
                    provider = %self.provider,
                    line = %truncate_chars(&redact_sensitive(line), 200),
                    "Skipping malformed upstream stream line"
                );
            }
            ParsedLine::Ignored | ParsedLine::Sentinel => {}
        }
    }

    fn finish(&mut self, outcome: &str) {
        self.phase = Phase::Finished;
        self.upstream = None;
        self.buffer.clear();
        get_metrics()
            .stream_outcomes
            .with_label_values(&[outcome])
            .inc();
    }

    fn complete(&mut self) {
        self.pending.push_back(DeltaEvent::Done);
        self.cancel.mark_completed();
        self.finish("completed");
        tracing::debug!(
            request_id = %self.request_id,
            provider = %self.provider,
            chunks = self.chunks,
            "Stream completed"
        );
    }

    fn fail(&mut self, error: StreamError) {
        self.pending.push_back(DeltaEvent::Error {
            message: error.public_message().to_string(),
        });
        self.cancel.mark_completed();
        self.finish(error.outcome());
        tracing::warn!(
            request_id = %self.request_id,
            provider = %self.provider,
            error = %error,
            "Stream terminated with error"
        );
    }

    fn abort(&mut self) {
        self.finish("cancelled");
        tracing::info!(request_id = %self.request_id, "Stream cancelled");
    }
}

impl<E> Drop for Transform<E> {
    fn drop(&mut self) {
        if self.phase != Phase::Finished {
            get_metrics()
                .stream_outcomes
                .with_label_values(&["disconnected"])
                .inc();
        }
    }
}

/// Resolves once cancellation has been signalled.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

/// Turn an upstream byte stream into canonical delta events.
///
/// The returned stream always starts with [`DeltaEvent::Meta`] and ends with
/// exactly one of [`DeltaEvent::Done`] or [`DeltaEvent::Error`], unless
/// `cancel` fires or the consumer drops it first.
pub fn transform<S, E>(
    upstream: S,
    model: impl Into<String>,
    provider: ProviderKind,
    options: StreamOptions,
    cancel: StreamCancelHandle,
) -> impl Stream<Item = DeltaEvent> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let now = Instant::now();
    let state = Transform {
        upstream: Some(upstream.boxed()),
        phase: Phase::Start,
        model: model.into(),
        provider,
        request_id: get_request_id(),
        options,
        buffer: Vec::new(),
        pending: VecDeque::new(),
        started: now,
        last_chunk: now,
        chunks: 0,
        cancel_rx: cancel.subscribe(),
        cancel,
    };

    futures::stream::unfold(state, |mut state| async move {
        let event = state.next_event().await?;
        Some((event, state))
    })
}

/// Build the SSE response for a streaming upstream reply.
pub fn sse_response(
    upstream: reqwest::Response,
    model: &str,
    provider: ProviderKind,
    options: StreamOptions,
) -> Response {
    let cancel = StreamCancelHandle::new();
    let encoder = SseEncoder::new(model);
    let frames = transform(
        upstream.bytes_stream(),
        model.to_string(),
        provider,
        options,
        cancel.clone(),
    )
    .map(move |event| Ok::<_, Infallible>(encoder.encode(&event)))
    .boxed();

    let body = Body::from_stream(DisconnectStream::new(frames, cancel));

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};

    /// Counts how many times the wrapped upstream is dropped.
    struct Tracked<S> {
        inner: S,
        drops: Arc<AtomicUsize>,
    }

    impl<S: Stream + Unpin> Stream for Tracked<S> {
        type Item = S::Item;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            Pin::new(&mut self.inner).poll_next(cx)
        }
    }

    impl<S> Drop for Tracked<S> {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Unpin {
        let items: Vec<Result<Bytes, std::io::Error>> = parts
            .iter()
            .map(|p| Ok(Bytes::from(p.to_string())))
            .collect();
        futures::stream::iter(items)
    }

    async fn run<S>(upstream: S, options: StreamOptions) -> Vec<DeltaEvent>
    where
        S: Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static,
    {
        transform(
            upstream,
            "@cf/meta/llama-3.1-8b-instruct",
            ProviderKind::Primary,
            options,
            StreamCancelHandle::new(),
        )
        .collect()
        .await
    }

    fn content(text: &str) -> DeltaEvent {
        DeltaEvent::Content {
            text: text.to_string(),
        }
    }

    fn meta() -> DeltaEvent {
        DeltaEvent::Meta {
            model: "@cf/meta/llama-3.1-8b-instruct".to_string(),
        }
    }

    #[test]
    fn test_parse_line() {
        assert_eq!(parse_line("data: {\"response\":\"hi\"}"), ParsedLine::Content("hi".into()));
        assert_eq!(parse_line("data:{\"response\":\"hi\"}\r"), ParsedLine::Content("hi".into()));
        assert_eq!(
            parse_line("data: {\"choices\":[{\"delta\":{\"content\":\"yo\"}}]}"),
            ParsedLine::Content("yo".into())
        );
        assert_eq!(parse_line("data: [DONE]"), ParsedLine::Sentinel);
        assert_eq!(parse_line("event: ping"), ParsedLine::Ignored);
        assert_eq!(parse_line(""), ParsedLine::Ignored);
        assert_eq!(parse_line("data: {\"choices\":[{\"delta\":{}}]}"), ParsedLine::Ignored);
        assert_eq!(parse_line("data: {not json"), ParsedLine::Malformed);
    }

    #[test]
    fn test_parse_line_truncates_content() {
        let long = "x".repeat(MAX_CONTENT_CHARS + 50);
        let line = format!("data: {}", json!({ "response": long }));
        match parse_line(&line) {
            ParsedLine::Content(text) => assert_eq!(text.chars().count(), MAX_CONTENT_CHARS),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_encoder_frames() {
        let encoder = SseEncoder::new("gpt-4o-mini");

        let role = encoder.encode(&DeltaEvent::Meta {
            model: "gpt-4o-mini".into(),
        });
        let role = std::str::from_utf8(&role).unwrap();
        assert!(role.starts_with("data: ") && role.ends_with("\n\n"));
        let chunk: StreamChunk = serde_json::from_str(role[6..].trim()).unwrap();
        assert_eq!(chunk.object, "chat.completion.chunk");
        assert_eq!(chunk.choices[0].delta.role.as_deref(), Some("assistant"));
        assert_eq!(chunk.choices[0].finish_reason, None);

        let done = encoder.encode(&DeltaEvent::Done);
        let done = std::str::from_utf8(&done).unwrap();
        assert!(done.contains("\"finish_reason\":\"stop\""));
        assert!(done.ends_with("data: [DONE]\n\n"));
        let stop: StreamChunk = serde_json::from_str(done.lines().next().unwrap()[6..].trim()).unwrap();
        assert_eq!(stop.id, chunk.id);

        let error = encoder.encode(&DeltaEvent::Error {
            message: "Request timeout".into(),
        });
        assert_eq!(
            std::str::from_utf8(&error).unwrap(),
            "data: {\"error\":{\"message\":\"Request timeout\"}}\n\n"
        );
    }

    #[tokio::test]
    async fn test_normal_stream() {
        let upstream = chunks(&[
            "data: {\"response\":\"Hel\"}\n\ndata: {\"resp",
            "onse\":\"lo\"}\n\n",
            "data: [DONE]\n\n",
        ]);
        let events = run(upstream, StreamOptions::default()).await;
        assert_eq!(events, vec![meta(), content("Hel"), content("lo"), DeltaEvent::Done]);
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let upstream = chunks(&[
            ": keep-alive\n",
            "data: {broken\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n",
        ]);
        let events = run(upstream, StreamOptions::default()).await;
        assert_eq!(events, vec![meta(), content("ok"), DeltaEvent::Done]);
    }

    #[tokio::test]
    async fn test_trailing_line_without_newline() {
        let upstream = chunks(&["data: {\"response\":\"tail\"}"]);
        let events = run(upstream, StreamOptions::default()).await;
        assert_eq!(events, vec![meta(), content("tail"), DeltaEvent::Done]);
    }

    #[tokio::test]
    async fn test_oversized_chunk_is_truncated() {
        let options = StreamOptions {
            max_chunk_size: 32,
            ..StreamOptions::default()
        };
        // The second line falls beyond the first 32 bytes and is lost
        let upstream = chunks(&["data: {\"response\":\"a\"}\ndata: {\"response\":\"bbbbbbbbbbbbbbbbbbbb\"}\n"]);
        let events = run(upstream, options).await;
        assert_eq!(events, vec![meta(), content("a"), DeltaEvent::Done]);
    }

    #[tokio::test]
    async fn test_buffer_cap_trims_oldest_bytes() {
        let options = StreamOptions {
            max_chunk_size: 16,
            ..StreamOptions::default()
        };
        let filler = "y".repeat(16);
        let upstream = chunks(&[&filler, &filler, &filler, &filler, &filler, "\n"]);
        let events = run(upstream, options).await;
        assert_eq!(events, vec![meta(), DeltaEvent::Done]);
    }

    #[tokio::test]
    async fn test_upstream_error_emits_error_without_done() {
        let drops = Arc::new(AtomicUsize::new(0));
        let items: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from("data: {\"response\":\"partial\"}\n")),
            Err(std::io::Error::other("connection reset")),
        ];
        let upstream = Tracked {
            inner: futures::stream::iter(items),
            drops: drops.clone(),
        };

        let mut stream = Box::pin(transform(
            upstream,
            "m",
            ProviderKind::Fallback,
            StreamOptions::default(),
            StreamCancelHandle::new(),
        ));
        assert_eq!(stream.next().await, Some(DeltaEvent::Meta { model: "m".into() }));
        assert_eq!(stream.next().await, Some(content("partial")));
        assert_eq!(
            stream.next().await,
            Some(DeltaEvent::Error {
                message: "Service unavailable".into()
            })
        );
        // Upstream is released as soon as the error is decided
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(stream.next().await, None);
        drop(stream);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_timeout_cancels_reader_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let upstream = Tracked {
            inner: futures::stream::pending::<Result<Bytes, std::io::Error>>(),
            drops: drops.clone(),
        };
        let start = Instant::now();

        let events = run(upstream, StreamOptions::default()).await;

        assert_eq!(
            events,
            vec![
                meta(),
                DeltaEvent::Error {
                    message: "Request timeout".into()
                }
            ]
        );
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(30) && elapsed < Duration::from_secs(31));
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_timeout_with_trickling_upstream() {
        let options = StreamOptions {
            total_timeout: Duration::from_secs(5),
            inactivity_timeout: Duration::from_secs(3),
            read_timeout: Duration::from_secs(1),
            ..StreamOptions::default()
        };
        let upstream = futures::stream::unfold(0u32, |n| async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Some((Ok(Bytes::from(format!("data: {{\"response\":\"{}\"}}\n", n))), n + 1))
        });
        let start = Instant::now();

        let events = run(upstream, options).await;

        assert_eq!(
            events,
            vec![
                meta(),
                content("0"),
                content("1"),
                DeltaEvent::Error {
                    message: "Request timeout".into()
                }
            ]
        );
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_chunk_limit() {
        let options = StreamOptions {
            max_chunks: 2,
            ..StreamOptions::default()
        };
        let upstream = futures::stream::repeat_with(|| {
            Ok::<_, std::io::Error>(Bytes::from("data: {\"response\":\"x\"}\n"))
        });
        let events = run(upstream, options).await;
        assert_eq!(
            events,
            vec![
                meta(),
                content("x"),
                content("x"),
                content("x"),
                DeltaEvent::Error {
                    message: "Stream aborted".into()
                }
            ]
        );
    }

    #[tokio::test]
    async fn test_cancel_handle_stops_stream() {
        let drops = Arc::new(AtomicUsize::new(0));
        let upstream = Tracked {
            inner: futures::stream::pending::<Result<Bytes, std::io::Error>>(),
            drops: drops.clone(),
        };
        let cancel = StreamCancelHandle::new();
        let mut stream = Box::pin(transform(
            upstream,
            "m",
            ProviderKind::Primary,
            StreamOptions::default(),
            cancel.clone(),
        ));

        assert_eq!(stream.next().await, Some(DeltaEvent::Meta { model: "m".into() }));
        cancel.cancel();
        assert_eq!(stream.next().await, None);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropping_consumer_releases_upstream() {
        let drops = Arc::new(AtomicUsize::new(0));
        let upstream = Tracked {
            inner: futures::stream::pending::<Result<Bytes, std::io::Error>>(),
            drops: drops.clone(),
        };
        let mut stream = Box::pin(transform(
            upstream,
            "m",
            ProviderKind::Primary,
            StreamOptions::default(),
            StreamCancelHandle::new(),
        ));
        assert!(stream.next().await.is_some());
        drop(stream);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sse_response_from_http_upstream() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "data: {\"response\":\"Hi\"}\n\ndata: [DONE]\n\n",
                "text/event-stream",
            ))
            .mount(&server)
            .await;

        let upstream = reqwest::Client::new().post(server.uri()).send().await.unwrap();
        let model = String::from("@cf/meta/llama-3.1-8b-instruct");
        let response = sse_response(upstream, &model, ProviderKind::Primary, StreamOptions::default());
        drop(model);

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = std::str::from_utf8(&body).unwrap();
        let frames: Vec<&str> = body.split("\n\n").filter(|f| !f.is_empty()).collect();
        assert_eq!(frames.len(), 4);
        assert!(frames[1].contains("\"content\":\"Hi\""));
        assert!(frames[1].contains("@cf/meta/llama-3.1-8b-instruct"));
        assert_eq!(frames[3], "data: [DONE]");
    }
}
