//! Guarded lifecycle transitions driven by processing workers.
//!
//! Each transition is a single conditional update on the expected prior
//! state. A mismatch leaves the record untouched and is reported as
//! [`ReconcileError::InvalidStateTransition`].

use chrono::Utc;

use crate::db::document_repo::{self, CasOutcome, StateUpdate};
use crate::db::Database;
use crate::document::{validate_structure, ChapterNode, DocumentRecord, ProcessingState};
use crate::error::ReconcileError;
use crate::events::{DocumentEvent, DocumentEventBroadcaster};

/// Calls block on the shared connection; async callers run them through
/// [`crate::db::blocking`].
#[derive(Clone)]
pub struct StatusReconciler {
    db: Database,
    events: Option<DocumentEventBroadcaster>,
}

impl StatusReconciler {
    pub fn new(db: Database) -> Self {
        Self { db, events: None }
    }

    pub fn with_events(mut self, events: DocumentEventBroadcaster) -> Self {
        self.events = Some(events);
        self
    }

    /// `pending -> processing`.
    pub fn mark_processing(&self, document_id: &str) -> Result<DocumentRecord, ReconcileError> {
        self.transition(document_id, ProcessingState::Pending, &StateUpdate::Processing)
    }

    /// `processing -> completed`, attaching the extracted structure and page
    /// count in the same write. The structure is validated first.
    pub fn mark_completed(
        &self,
        document_id: &str,
        structure: &[ChapterNode],
        page_count: u32,
    ) -> Result<DocumentRecord, ReconcileError> {
        if let Err(e) = validate_structure(structure) {
            log::warn!("Rejected structure for document {}: {}", document_id, e);
            return Err(e.into());
        }

        self.transition(
            document_id,
            ProcessingState::Processing,
            &StateUpdate::Completed {
                structure,
                page_count,
            },
        )
    }

    /// `processing -> failed`.
    pub fn mark_failed(
        &self,
        document_id: &str,
        reason: &str,
    ) -> Result<DocumentRecord, ReconcileError> {
        self.transition(
            document_id,
            ProcessingState::Processing,
            &StateUpdate::Failed { reason },
        )
    }

    pub fn current_state(&self, document_id: &str) -> Result<ProcessingState, ReconcileError> {
        document_repo::find_state(&self.db, document_id)?
            .ok_or_else(|| ReconcileError::NotFound(document_id.to_string()))
    }

    fn transition(
        &self,
        document_id: &str,
        expected: ProcessingState,
        update: &StateUpdate<'_>,
    ) -> Result<DocumentRecord, ReconcileError> {
        let target = update.target();

        match document_repo::compare_and_set(&self.db, document_id, expected, update, Utc::now())? {
            CasOutcome::Applied(record) => {
                log::info!("Document {}: {} -> {}", document_id, expected, target);
                if let Some(events) = &self.events {
                    events.send(DocumentEvent::state_changed(
                        document_id,
                        target,
                        record.failure_reason.as_deref(),
                    ));
                }
                Ok(record)
            }
            CasOutcome::Conflict { actual } => {
                log::warn!(
                    "Refused transition of document {} to {}: expected {}, found {}",
                    document_id,
                    target,
                    expected,
                    actual
                );
                Err(ReconcileError::InvalidStateTransition {
                    document_id: document_id.to_string(),
                    expected,
                    actual,
                })
            }
            CasOutcome::NotFound => {
                log::warn!("Refused transition to {}: document {} not found", target, document_id);
                Err(ReconcileError::NotFound(document_id.to_string()))
            }
        }
    }
}
