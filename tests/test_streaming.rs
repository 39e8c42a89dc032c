//! End-to-end behaviour of the streaming pipeline: upstream bytes through the
//! transform, the SSE encoder and the disconnect-aware body wrapper.

use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use llm_fallback_gateway::api::disconnect::DisconnectStream;
use llm_fallback_gateway::api::models::{ProviderKind, StreamChunk};
use llm_fallback_gateway::api::streaming::{transform, DeltaEvent, SseEncoder, StreamOptions};
use llm_fallback_gateway::core::cancel::StreamCancelHandle;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Instant;

const MODEL: &str = "@cf/meta/llama-3.1-8b-instruct";

/// Upstream wrapper that records when it is released.
struct Released<S> {
    inner: S,
    drops: Arc<AtomicUsize>,
}

impl<S: Stream + Unpin> Stream for Released<S> {
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl<S> Drop for Released<S> {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Sends `parts` one at a time, then stays silent forever.
fn then_silence(parts: Vec<&'static str>) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Unpin {
    futures::stream::iter(parts.into_iter().map(|p| Ok(Bytes::from(p))))
        .chain(futures::stream::pending())
}

/// Same wiring as the HTTP handler, minus the hyper body.
fn sse_body<S>(
    upstream: S,
    options: StreamOptions,
    cancel: StreamCancelHandle,
) -> DisconnectStream<futures::stream::BoxStream<'static, Result<Bytes, Infallible>>>
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static,
{
    let encoder = SseEncoder::new(MODEL);
    let frames = transform(upstream, MODEL, ProviderKind::Primary, options, cancel.clone())
        .map(move |event| Ok::<_, Infallible>(encoder.encode(&event)))
        .boxed();
    DisconnectStream::new(frames, cancel)
}

async fn collect_wire<S>(body: S) -> String
where
    S: Stream<Item = Result<Bytes, Infallible>>,
{
    let frames: Vec<Bytes> = body.map(|frame| frame.unwrap()).collect().await;
    frames
        .iter()
        .map(|frame| String::from_utf8_lossy(frame).into_owned())
        .collect()
}

fn data_lines(wire: &str) -> Vec<&str> {
    wire.lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .collect()
}

#[tokio::test]
async fn test_mixed_provider_formats_normalise_to_one_shape() {
    let upstream = futures::stream::iter(vec![
        Ok(Bytes::from("data: {\"response\":\"Hello\"}\n\n")),
        Ok(Bytes::from(
            "data: {\"choices\":[{\"delta\":{\"content\":\", world\"}}]}\n\n",
        )),
        Ok(Bytes::from("data: [DONE]\n\n")),
    ]);

    let wire = collect_wire(sse_body(upstream, StreamOptions::default(), StreamCancelHandle::new())).await;
    let lines = data_lines(&wire);

    assert_eq!(lines.iter().filter(|l| **l == "[DONE]").count(), 1);
    assert_eq!(lines.last(), Some(&"[DONE]"));

    let chunks: Vec<StreamChunk> = lines
        .iter()
        .filter(|l| **l != "[DONE]")
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(chunks.len(), 4);
    assert!(chunks.iter().all(|c| c.id == chunks[0].id));
    assert!(chunks.iter().all(|c| c.object == "chat.completion.chunk"));

    let text: String = chunks
        .iter()
        .filter_map(|c| c.choices[0].delta.content.clone())
        .collect();
    assert_eq!(text, "Hello, world");
    assert_eq!(chunks[3].choices[0].finish_reason.as_deref(), Some("stop"));
}

#[tokio::test(start_paused = true)]
async fn test_silent_upstream_times_out_after_inactivity() {
    let drops = Arc::new(AtomicUsize::new(0));
    let upstream = Released {
        inner: then_silence(vec![
            "data: {\"response\":\"one\"}\n",
            "data: {\"response\":\"two\"}\n",
        ]),
        drops: drops.clone(),
    };
    let start = Instant::now();

    let events: Vec<DeltaEvent> = transform(
        upstream,
        MODEL,
        ProviderKind::Primary,
        StreamOptions::default(),
        StreamCancelHandle::new(),
    )
    .collect()
    .await;

    assert_eq!(events.len(), 4);
    assert_eq!(
        events.last(),
        Some(&DeltaEvent::Error {
            message: "Request timeout".to_string()
        })
    );
    assert!(!events.contains(&DeltaEvent::Done));

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(30) && elapsed < Duration::from_secs(31));
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_error_frame_ends_wire_without_done() {
    let upstream = then_silence(vec!["data: {\"response\":\"partial\"}\n"]);

    let wire = collect_wire(sse_body(upstream, StreamOptions::default(), StreamCancelHandle::new())).await;
    let lines = data_lines(&wire);

    assert!(!lines.contains(&"[DONE]"));
    assert_eq!(lines.last(), Some(&"{\"error\":{\"message\":\"Request timeout\"}}"));
}

#[tokio::test]
async fn test_client_drop_mid_stream_releases_upstream() {
    let drops = Arc::new(AtomicUsize::new(0));
    let upstream = Released {
        inner: then_silence(vec!["data: {\"response\":\"first\"}\n"]),
        drops: drops.clone(),
    };
    let cancel = StreamCancelHandle::new();
    let mut body = sse_body(upstream, StreamOptions::default(), cancel.clone());

    // Role frame, then the first content frame
    assert!(body.next().await.is_some());
    assert!(body.next().await.is_some());
    assert_eq!(drops.load(Ordering::SeqCst), 0);

    drop(body);

    assert!(cancel.is_cancelled());
    assert!(!cancel.is_completed());
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_completed_stream_is_not_reported_as_disconnect() {
    let upstream = futures::stream::iter(vec![Ok(Bytes::from("data: {\"response\":\"ok\"}\n"))]);
    let cancel = StreamCancelHandle::new();

    let wire = collect_wire(sse_body(upstream, StreamOptions::default(), cancel.clone())).await;

    assert!(wire.ends_with("data: [DONE]\n\n"));
    assert!(cancel.is_completed());
    assert!(!cancel.is_cancelled());
}
