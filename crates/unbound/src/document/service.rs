//! Creation and read boundary for documents.

use chrono::Utc;

use super::model::{DocumentRecord, NewDocument};
use crate::db::{self, document_repo, Database};
use crate::enqueue::{EnqueueOutcome, EnqueueService};
use crate::error::DocumentError;
use crate::events::{DocumentEvent, DocumentEventBroadcaster};

#[derive(Clone)]
pub struct DocumentService {
    db: Database,
    enqueue: EnqueueService,
    events: Option<DocumentEventBroadcaster>,
}

impl DocumentService {
    pub fn new(db: Database, enqueue: EnqueueService) -> Self {
        Self {
            db,
            enqueue,
            events: None,
        }
    }

    pub fn with_events(mut self, events: DocumentEventBroadcaster) -> Self {
        self.events = Some(events);
        self
    }

    /// Validates and stores a new `pending` document, then hands it to the
    /// processing queue.
    ///
    /// The record is returned whether or not the job could be enqueued; in
    /// the latter case it simply stays `pending`.
    pub async fn create_document(&self, input: NewDocument) -> Result<DocumentRecord, DocumentError> {
        let input = input.validate()?;
        let record = DocumentRecord::pending(input, Utc::now());

        let store = self.db.clone();
        let record = db::blocking(move || {
            document_repo::insert(&store, &record)?;
            Ok::<_, DocumentError>(record)
        })
        .await?;
        log::info!(
            "Created document {} '{}' for owner {}",
            record.id,
            record.title,
            record.owner_id
        );
        self.publish(DocumentEvent::created(&record.id));

        let outcome = self
            .enqueue
            .enqueue_processing(&record.id, &record.source_location)
            .await;
        if let EnqueueOutcome::Deferred { reason } = &outcome {
            self.publish(DocumentEvent::enqueue_deferred(&record.id, reason));
        }

        Ok(record)
    }

    pub fn get_document(&self, id: &str) -> Result<DocumentRecord, DocumentError> {
        document_repo::find_by_id(&self.db, id)?
            .ok_or_else(|| DocumentError::NotFound(id.to_string()))
    }

    /// Owner's documents, newest first.
    pub fn list_documents(&self, owner_id: &str) -> Result<Vec<DocumentRecord>, DocumentError> {
        Ok(document_repo::list_by_owner(&self.db, owner_id)?)
    }

    fn publish(&self, event: DocumentEvent) {
        if let Some(events) = &self.events {
            events.send(event);
        }
    }
}
