//! Typed broadcast channel for cross-component signals
//!
//! Replaces ad-hoc string events ("reset entity highlights", "force
//! reprocess") with an enum carried over a `tokio::sync::broadcast` channel.
//! Publishing never blocks and works without a runtime.

use crate::viewport::PageSizeInfo;
use tokio::sync::broadcast;

/// Signals published by the store, the processing registry and the alignment layer
#[derive(Debug, Clone, PartialEq)]
pub enum HighlightEvent {
    /// The stored highlights of a file changed
    AnnotationsChanged { file_key: String, revision: u64 },
    /// A file's entity tracking was reset; listeners should rerun detection rendering
    ReprocessRequested { file_key: String },
    /// A file was closed and all of its tracking dropped
    FileClosed { file_key: String },
    /// New measured size for a rendered page of a file
    PageSizeChanged {
        file_key: String,
        page: u32,
        size: PageSizeInfo,
    },
}

impl HighlightEvent {
    /// File the event is scoped to
    pub fn file_key(&self) -> &str {
        match self {
            HighlightEvent::AnnotationsChanged { file_key, .. }
            | HighlightEvent::ReprocessRequested { file_key }
            | HighlightEvent::FileClosed { file_key }
            | HighlightEvent::PageSizeChanged { file_key, .. } => file_key,
        }
    }
}

/// Cloneable handle to a shared broadcast channel
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<HighlightEvent>,
}

impl EventBus {
    /// Create a bus that keeps at most `capacity` undelivered events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HighlightEvent> {
        self.sender.subscribe()
    }

    /// Publish to all current subscribers, returns how many received it
    pub fn publish(&self, event: HighlightEvent) -> usize {
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(broadcast::error::SendError(event)) => {
                tracing::trace!(?event, "no event subscribers");
                0
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
