//! Document lifecycle broadcaster for real-time status streaming.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::document::ProcessingState;

/// What happened to a document.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DocumentEventKind {
    Created,
    /// The processing job could not be enqueued; the document stays pending.
    EnqueueDeferred,
    StateChanged,
}

/// Status event for a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentEvent {
    pub document_id: String,
    pub kind: DocumentEventKind,
    /// State after the event.
    pub state: ProcessingState,
    /// Failure reason or enqueue error, when there is one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl DocumentEvent {
    pub fn created(document_id: &str) -> Self {
        Self::new(document_id, DocumentEventKind::Created, ProcessingState::Pending, None)
    }

    pub fn enqueue_deferred(document_id: &str, reason: &str) -> Self {
        Self::new(
            document_id,
            DocumentEventKind::EnqueueDeferred,
            ProcessingState::Pending,
            Some(reason.to_string()),
        )
    }

    pub fn state_changed(document_id: &str, state: ProcessingState, reason: Option<&str>) -> Self {
        Self::new(
            document_id,
            DocumentEventKind::StateChanged,
            state,
            reason.map(str::to_string),
        )
    }

    fn new(
        document_id: &str,
        kind: DocumentEventKind,
        state: ProcessingState,
        reason: Option<String>,
    ) -> Self {
        Self {
            document_id: document_id.to_string(),
            kind,
            state,
            reason,
            timestamp: Utc::now(),
        }
    }
}

/// Fan-out of document events to any number of subscribers.
#[derive(Clone)]
pub struct DocumentEventBroadcaster {
    sender: Arc<broadcast::Sender<DocumentEvent>>,
}

impl DocumentEventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, event: DocumentEvent) {
        // No active receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DocumentEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for DocumentEventBroadcaster {
    fn default() -> Self {
        Self::new(100)
    }
}
