use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Handle shared between a streaming response body and the producer feeding
/// it, used to tell a client disconnect apart from a normal end of stream.
#[derive(Clone)]
pub struct StreamCancelHandle {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
    /// Set once the stream reached a terminal event on its own
    completed: Arc<AtomicBool>,
}

impl StreamCancelHandle {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
            completed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Mark the stream as completed normally.
    pub fn mark_completed(&self) {
        self.completed.store(true, Ordering::SeqCst);
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Signal cancellation (only if not already completed)
    pub fn cancel(&self) {
        if !self.is_completed() {
            let _ = self.sender.send(true);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Get a receiver for use in select!
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.receiver.clone()
    }
}

impl Default for StreamCancelHandle {
    fn default() -> Self {
        Self::new()
    }
}
