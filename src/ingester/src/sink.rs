//! Destination for decorated events.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::event::Event;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("event sink is closed")]
    Closed,
}

/// Append-only destination for events.
///
/// `push` may wait when the sink is full; that wait happens inside the
/// per-object emit step.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn push(&self, event: Event) -> Result<(), SinkError>;
}

#[async_trait]
impl EventSink for mpsc::Sender<Event> {
    async fn push(&self, event: Event) -> Result<(), SinkError> {
        self.send(event).await.map_err(|_| SinkError::Closed)
    }
}
