//! Broadcast stream of run progress events.
//!
//! Built on `tokio::sync::broadcast`. Publishing never blocks: without
//! subscribers the event is dropped, and slow subscribers observe
//! `RecvError::Lagged` instead of stalling the executor.

use panefleet_types::execution::{ProgressEvent, ProgressEventKind};
use tokio::sync::broadcast;

pub struct ProgressBus {
    sender: broadcast::Sender<ProgressEvent>,
}

impl ProgressBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: ProgressEvent) {
        let _ = self.sender.send(event);
    }

    /// Build and publish an event in one call.
    pub fn emit(
        &self,
        kind: ProgressEventKind,
        step_id: Option<&str>,
        message: impl Into<String>,
        progress: f64,
    ) {
        self.publish(ProgressEvent::new(kind, step_id, message, progress));
    }
}

impl Clone for ProgressBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for ProgressBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}
