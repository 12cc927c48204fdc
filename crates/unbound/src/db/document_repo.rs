//! Document repository: persistence for the `documents` table.
//!
//! Lifecycle changes go through [`compare_and_set`], a conditional update
//! keyed on the expected prior state. Nothing in this module overwrites
//! `processing_state` blindly.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{Database, DatabaseError};
use crate::document::{ChapterNode, DocumentRecord, ProcessingState};

/// Timestamps are stored as fixed-width RFC 3339 so they sort as text.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_timestamp(column: &'static str, raw: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Corrupt {
            column,
            reason: e.to_string(),
        })
}

/// One chapter as stored: the tree is kept as a pre-order list tagged with
/// depth, so encoding and decoding never recurse however deep it is.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredChapter {
    depth: usize,
    title: String,
    slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    page_start: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

fn encode_structure(structure: &[ChapterNode]) -> Result<String, DatabaseError> {
    let mut flat = Vec::new();
    let mut stack: Vec<(usize, &ChapterNode)> = structure.iter().rev().map(|n| (0, n)).collect();

    while let Some((depth, node)) = stack.pop() {
        flat.push(StoredChapter {
            depth,
            title: node.title.clone(),
            slug: node.slug.clone(),
            page_start: node.page_start,
            content: node.content.clone(),
        });
        stack.extend(node.children.iter().rev().map(|child| (depth + 1, child)));
    }

    serde_json::to_string(&flat).map_err(|e| DatabaseError::Corrupt {
        column: "structure",
        reason: e.to_string(),
    })
}

fn decode_structure(raw: &str) -> Result<Vec<ChapterNode>, DatabaseError> {
    let flat: Vec<StoredChapter> =
        serde_json::from_str(raw).map_err(|e| DatabaseError::Corrupt {
            column: "structure",
            reason: e.to_string(),
        })?;

    let mut roots = Vec::new();
    // Open ancestors of the next chapter, outermost first.
    let mut open: Vec<ChapterNode> = Vec::new();

    fn close(open: &mut Vec<ChapterNode>, roots: &mut Vec<ChapterNode>) {
        if let Some(node) = open.pop() {
            match open.last_mut() {
                Some(parent) => parent.children.push(node),
                None => roots.push(node),
            }
        }
    }

    for chapter in flat {
        if chapter.depth > open.len() {
            return Err(DatabaseError::Corrupt {
                column: "structure",
                reason: format!(
                    "chapter '{}' at depth {} has no parent",
                    chapter.slug, chapter.depth
                ),
            });
        }
        while open.len() > chapter.depth {
            close(&mut open, &mut roots);
        }
        open.push(ChapterNode {
            title: chapter.title,
            slug: chapter.slug,
            page_start: chapter.page_start,
            content: chapter.content,
            children: Vec::new(),
        });
    }
    while !open.is_empty() {
        close(&mut open, &mut roots);
    }

    Ok(roots)
}

/// A raw document row from the database.
#[derive(Debug, Clone)]
struct DocumentRow {
    id: String,
    owner_id: String,
    title: String,
    source_location: String,
    processing_state: String,
    structure: Option<String>,
    page_count: Option<u32>,
    failure_reason: Option<String>,
    is_public: bool,
    created_at: String,
    updated_at: String,
}

impl DocumentRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            owner_id: row.get("owner_id")?,
            title: row.get("title")?,
            source_location: row.get("source_location")?,
            processing_state: row.get("processing_state")?,
            structure: row.get("structure")?,
            page_count: row.get("page_count")?,
            failure_reason: row.get("failure_reason")?,
            is_public: row.get("is_public")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn into_record(self) -> Result<DocumentRecord, DatabaseError> {
        let processing_state = self
            .processing_state
            .parse::<ProcessingState>()
            .map_err(|reason| DatabaseError::Corrupt {
                column: "processing_state",
                reason,
            })?;

        let structure = self.structure.as_deref().map(decode_structure).transpose()?;

        Ok(DocumentRecord {
            id: self.id,
            owner_id: self.owner_id,
            title: self.title,
            source_location: self.source_location,
            processing_state,
            structure,
            page_count: self.page_count,
            failure_reason: self.failure_reason,
            is_public: self.is_public,
            created_at: parse_timestamp("created_at", &self.created_at)?,
            updated_at: parse_timestamp("updated_at", &self.updated_at)?,
        })
    }
}

/// The write half of a lifecycle transition.
#[derive(Debug, Clone)]
pub enum StateUpdate<'a> {
    Processing,
    Completed {
        structure: &'a [ChapterNode],
        page_count: u32,
    },
    Failed {
        reason: &'a str,
    },
}

impl StateUpdate<'_> {
    pub fn target(&self) -> ProcessingState {
        match self {
            StateUpdate::Processing => ProcessingState::Processing,
            StateUpdate::Completed { .. } => ProcessingState::Completed,
            StateUpdate::Failed { .. } => ProcessingState::Failed,
        }
    }
}

/// Result of a conditional update.
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    /// The row was in the expected state and now holds the new one.
    Applied(DocumentRecord),
    /// The row exists but was not in the expected state; nothing changed.
    Conflict { actual: ProcessingState },
    NotFound,
}

/// Inserts a new document row.
pub fn insert(db: &Database, doc: &DocumentRecord) -> Result<(), DatabaseError> {
    let structure = doc.structure.as_deref().map(encode_structure).transpose()?;

    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO documents (id, owner_id, title, source_location, processing_state,
             structure, page_count, failure_reason, is_public, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                doc.id,
                doc.owner_id,
                doc.title,
                doc.source_location,
                doc.processing_state.as_str(),
                structure,
                doc.page_count,
                doc.failure_reason,
                doc.is_public,
                format_timestamp(&doc.created_at),
                format_timestamp(&doc.updated_at),
            ],
        )?;
        Ok(())
    })
}

fn find_in(conn: &Connection, id: &str) -> Result<Option<DocumentRecord>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM documents WHERE id = ?1",
            params![id],
            DocumentRow::from_row,
        )
        .optional()?;
    row.map(DocumentRow::into_record).transpose()
}

/// Finds a document by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<DocumentRecord>, DatabaseError> {
    db.with_conn(|conn| find_in(conn, id))
}

/// Returns only the lifecycle state of a document.
pub fn find_state(db: &Database, id: &str) -> Result<Option<ProcessingState>, DatabaseError> {
    db.with_conn(|conn| {
        let raw: Option<String> = conn
            .query_row(
                "SELECT processing_state FROM documents WHERE id = ?1",
                params![id],
                |r| r.get(0),
            )
            .optional()?;
        raw.map(|s| {
            s.parse::<ProcessingState>()
                .map_err(|reason| DatabaseError::Corrupt {
                    column: "processing_state",
                    reason,
                })
        })
        .transpose()
    })
}

/// Lists an owner's documents, newest first.
pub fn list_by_owner(db: &Database, owner_id: &str) -> Result<Vec<DocumentRecord>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM documents WHERE owner_id = ?1 ORDER BY created_at DESC, rowid DESC",
        )?;
        let rows = stmt
            .query_map(params![owner_id], DocumentRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(DocumentRow::into_record).collect()
    })
}

/// Moves a document from `expected` to the state carried by `update`, but
/// only if it is still in `expected`.
///
/// The state, structure and page count are written by one statement, so no
/// reader observes `completed` without its structure. Returns the record as
/// stored.
pub fn compare_and_set(
    db: &Database,
    id: &str,
    expected: ProcessingState,
    update: &StateUpdate<'_>,
    now: DateTime<Utc>,
) -> Result<CasOutcome, DatabaseError> {
    let updated_at = format_timestamp(&now);

    let structure_json = match update {
        StateUpdate::Completed { structure, .. } => Some(encode_structure(structure)?),
        _ => None,
    };

    // The reload shares the transaction, so an update whose row cannot be
    // read back is rolled back rather than reported as a failure after the fact.
    db.with_tx(|conn| {
        let changed = match update {
            StateUpdate::Processing => conn.execute(
                "UPDATE documents SET processing_state = ?3, updated_at = ?4
                 WHERE id = ?1 AND processing_state = ?2",
                params![id, expected.as_str(), update.target().as_str(), updated_at],
            )?,
            StateUpdate::Completed { page_count, .. } => conn.execute(
                "UPDATE documents SET processing_state = ?3, structure = ?4, page_count = ?5,
                 updated_at = ?6
                 WHERE id = ?1 AND processing_state = ?2",
                params![
                    id,
                    expected.as_str(),
                    update.target().as_str(),
                    structure_json,
                    page_count,
                    updated_at
                ],
            )?,
            StateUpdate::Failed { reason } => conn.execute(
                "UPDATE documents SET processing_state = ?3, failure_reason = ?4, updated_at = ?5
                 WHERE id = ?1 AND processing_state = ?2",
                params![id, expected.as_str(), update.target().as_str(), reason, updated_at],
            )?,
        };

        match find_in(conn, id)? {
            Some(record) if changed == 1 => Ok(CasOutcome::Applied(record)),
            Some(record) => Ok(CasOutcome::Conflict {
                actual: record.processing_state,
            }),
            None => Ok(CasOutcome::NotFound),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::NewDocument;
    use chrono::Duration;

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    fn sample_doc(owner: &str, title: &str) -> DocumentRecord {
        DocumentRecord::pending(
            NewDocument::new(owner, title, format!("file://{}.pdf", title)),
            Utc::now(),
        )
    }

    #[test]
    fn test_insert_and_find() {
        let db = test_db();
        let doc = sample_doc("u1", "bio101");
        insert(&db, &doc).unwrap();

        let found = find_by_id(&db, &doc.id).unwrap().unwrap();
        assert_eq!(found.title, "bio101");
        assert_eq!(found.processing_state, ProcessingState::Pending);
        assert_eq!(found.source_location, "file://bio101.pdf");
        assert!(found.structure.is_none());
        assert!(!found.is_public);
        assert_eq!(
            format_timestamp(&found.created_at),
            format_timestamp(&doc.created_at)
        );
    }

    #[test]
    fn test_find_nonexistent() {
        let db = test_db();
        assert!(find_by_id(&db, "missing").unwrap().is_none());
        assert!(find_state(&db, "missing").unwrap().is_none());
    }

    #[test]
    fn test_list_by_owner_newest_first() {
        let db = test_db();
        let base = Utc::now();
        for (i, title) in ["first", "second", "third"].iter().enumerate() {
            let mut doc = sample_doc("u1", title);
            doc.created_at = base + Duration::seconds(i as i64);
            insert(&db, &doc).unwrap();
        }
        insert(&db, &sample_doc("u2", "other")).unwrap();

        let titles: Vec<String> = list_by_owner(&db, "u1")
            .unwrap()
            .into_iter()
            .map(|d| d.title)
            .collect();
        assert_eq!(titles, vec!["third", "second", "first"]);
    }

    #[test]
    fn test_list_by_owner_breaks_ties_by_insertion() {
        let db = test_db();
        let now = Utc::now();
        for title in ["a", "b"] {
            let mut doc = sample_doc("u1", title);
            doc.created_at = now;
            insert(&db, &doc).unwrap();
        }

        let titles: Vec<String> = list_by_owner(&db, "u1")
            .unwrap()
            .into_iter()
            .map(|d| d.title)
            .collect();
        assert_eq!(titles, vec!["b", "a"]);
    }

    #[test]
    fn test_compare_and_set_applies_in_expected_state() {
        let db = test_db();
        let doc = sample_doc("u1", "bio");
        insert(&db, &doc).unwrap();

        let outcome = compare_and_set(
            &db,
            &doc.id,
            ProcessingState::Pending,
            &StateUpdate::Processing,
            Utc::now(),
        )
        .unwrap();
        match outcome {
            CasOutcome::Applied(record) => {
                assert_eq!(record.processing_state, ProcessingState::Processing)
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_compare_and_set_conflict_leaves_row_untouched() {
        let db = test_db();
        let doc = sample_doc("u1", "bio");
        insert(&db, &doc).unwrap();

        let structure = vec![ChapterNode::new("Ch1", "ch1")];
        let outcome = compare_and_set(
            &db,
            &doc.id,
            ProcessingState::Processing,
            &StateUpdate::Completed {
                structure: &structure,
                page_count: 10,
            },
            Utc::now(),
        )
        .unwrap();
        assert_eq!(
            outcome,
            CasOutcome::Conflict {
                actual: ProcessingState::Pending
            }
        );

        let found = find_by_id(&db, &doc.id).unwrap().unwrap();
        assert_eq!(found.processing_state, ProcessingState::Pending);
        assert!(found.structure.is_none());
        assert!(found.page_count.is_none());
    }

    #[test]
    fn test_compare_and_set_completed_writes_structure() {
        let db = test_db();
        let doc = sample_doc("u1", "bio");
        insert(&db, &doc).unwrap();
        compare_and_set(
            &db,
            &doc.id,
            ProcessingState::Pending,
            &StateUpdate::Processing,
            Utc::now(),
        )
        .unwrap();

        let structure = vec![ChapterNode::new("Ch1", "ch1")
            .with_children(vec![ChapterNode::new("Sec 1.1", "sec-1-1").with_page_start(4)])];
        compare_and_set(
            &db,
            &doc.id,
            ProcessingState::Processing,
            &StateUpdate::Completed {
                structure: &structure,
                page_count: 42,
            },
            Utc::now(),
        )
        .unwrap();

        let found = find_by_id(&db, &doc.id).unwrap().unwrap();
        assert_eq!(found.processing_state, ProcessingState::Completed);
        assert_eq!(found.page_count, Some(42));
        assert_eq!(found.structure, Some(structure));
    }

    #[test]
    fn test_compare_and_set_not_found() {
        let db = test_db();
        let outcome = compare_and_set(
            &db,
            "missing",
            ProcessingState::Pending,
            &StateUpdate::Processing,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(outcome, CasOutcome::NotFound);
    }

    #[test]
    fn test_corrupt_state_is_reported() {
        let db = test_db();
        let doc = sample_doc("u1", "bio");
        insert(&db, &doc).unwrap();
        db.with_conn(|conn| {
            conn.execute_batch("PRAGMA ignore_check_constraints = ON;")?;
            conn.execute(
                "UPDATE documents SET processing_state = 'archived' WHERE id = ?1",
                params![doc.id],
            )?;
            Ok(())
        })
        .unwrap();

        let err = find_by_id(&db, &doc.id).unwrap_err();
        assert!(matches!(
            err,
            DatabaseError::Corrupt {
                column: "processing_state",
                ..
            }
        ));
    }

    fn deep_tree(depth: usize) -> Vec<ChapterNode> {
        let mut node = ChapterNode::new("Leaf", format!("level-{}", depth - 1));
        for level in (0..depth - 1).rev() {
            node = ChapterNode::new(format!("Level {}", level), format!("level-{}", level))
                .with_children(vec![node]);
        }
        vec![node]
    }

    #[test]
    fn test_structure_encoding_keeps_order_and_nesting() {
        let structure = vec![
            ChapterNode::new("Atoms", "atoms").with_children(vec![
                ChapterNode::new("Electrons", "electrons").with_page_start(3),
                ChapterNode::new("Nuclei", "nuclei")
                    .with_children(vec![ChapterNode::new("Isotopes", "isotopes")]),
            ]),
            ChapterNode::new("Bonds", "bonds").with_page_start(20),
        ];

        let raw = encode_structure(&structure).unwrap();
        assert!(raw.contains(r#""depth":2"#));
        assert_eq!(decode_structure(&raw).unwrap(), structure);
    }

    #[test]
    fn test_deep_structure_survives_storage() {
        let db = test_db();
        let doc = sample_doc("u1", "deep");
        insert(&db, &doc).unwrap();
        compare_and_set(
            &db,
            &doc.id,
            ProcessingState::Pending,
            &StateUpdate::Processing,
            Utc::now(),
        )
        .unwrap();

        let structure = deep_tree(500);
        let outcome = compare_and_set(
            &db,
            &doc.id,
            ProcessingState::Processing,
            &StateUpdate::Completed {
                structure: &structure,
                page_count: 1,
            },
            Utc::now(),
        )
        .unwrap();
        assert!(matches!(outcome, CasOutcome::Applied(_)));

        let found = find_by_id(&db, &doc.id).unwrap().unwrap();
        assert_eq!(found.structure, Some(structure));
        assert_eq!(list_by_owner(&db, "u1").unwrap().len(), 1);
    }

    #[test]
    fn test_orphan_chapter_is_corrupt() {
        let err = decode_structure(r#"[{"depth":1,"title":"Lost","slug":"lost"}]"#).unwrap_err();
        assert!(matches!(
            err,
            DatabaseError::Corrupt {
                column: "structure",
                ..
            }
        ));
    }

    #[test]
    fn test_unreadable_row_rolls_back_transition() {
        let db = test_db();
        let doc = sample_doc("u1", "bio");
        insert(&db, &doc).unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE documents SET created_at = 'yesterday' WHERE id = ?1",
                params![doc.id],
            )?;
            Ok(())
        })
        .unwrap();

        let err = compare_and_set(
            &db,
            &doc.id,
            ProcessingState::Pending,
            &StateUpdate::Processing,
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            DatabaseError::Corrupt {
                column: "created_at",
                ..
            }
        ));
        assert_eq!(
            find_state(&db, &doc.id).unwrap(),
            Some(ProcessingState::Pending)
        );
    }
}
