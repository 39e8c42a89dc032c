use crate::core::cancel::StreamCancelHandle;
use crate::core::logging::get_request_id;
use axum::body::Bytes;
use futures::stream::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};

/// A response body wrapper that fires its cancel handle when dropped.
///
/// Hyper drops the body as soon as the client goes away, so this is where a
/// disconnect first becomes visible to the gateway.
pub struct DisconnectStream<S> {
    stream: S,
    cancel_handle: StreamCancelHandle,
    request_id: String,
}

impl<S> DisconnectStream<S> {
    pub fn new(stream: S, cancel_handle: StreamCancelHandle) -> Self {
        Self {
            stream,
            cancel_handle,
            request_id: get_request_id(),
        }
    }
}

impl<S, E> Stream for DisconnectStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.stream).poll_next(cx)
    }
}

impl<S> Drop for DisconnectStream<S> {
    fn drop(&mut self) {
        // A stream that reached its terminal event marks itself completed first
        if !self.cancel_handle.is_completed() {
            tracing::info!(
                request_id = %self.request_id,
                "Client disconnected during streaming"
            );
        }
        self.cancel_handle.cancel();
    }
}
