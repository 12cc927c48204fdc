//! Document records and their processing lifecycle.

use std::collections::HashSet;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Lifecycle of an uploaded document.
///
/// `pending -> processing -> {completed, failed}`. Nothing leaves a terminal
/// state and nothing returns to `pending`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProcessingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingState::Pending => "pending",
            ProcessingState::Processing => "processing",
            ProcessingState::Completed => "completed",
            ProcessingState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingState::Completed | ProcessingState::Failed)
    }

    /// Whether `next` is a legal single step from `self`.
    pub fn can_transition_to(&self, next: ProcessingState) -> bool {
        matches!(
            (self, next),
            (ProcessingState::Pending, ProcessingState::Processing)
                | (ProcessingState::Processing, ProcessingState::Completed)
                | (ProcessingState::Processing, ProcessingState::Failed)
        )
    }
}

impl std::fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProcessingState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProcessingState::Pending),
            "processing" => Ok(ProcessingState::Processing),
            "completed" => Ok(ProcessingState::Completed),
            "failed" => Ok(ProcessingState::Failed),
            other => Err(format!("unknown processing state '{}'", other)),
        }
    }
}

/// One entry in a document's table of contents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChapterNode {
    pub title: String,
    /// URL-safe, unique within the whole tree of one document.
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_start: Option<u32>,
    /// Short summary or text snippet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default)]
    pub children: Vec<ChapterNode>,
}

impl ChapterNode {
    pub fn new(title: impl Into<String>, slug: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            slug: slug.into(),
            page_start: None,
            content: None,
            children: Vec::new(),
        }
    }

    pub fn with_page_start(mut self, page: u32) -> Self {
        self.page_start = Some(page);
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_children(mut self, children: Vec<ChapterNode>) -> Self {
        self.children = children;
        self
    }
}

fn slug_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("slug pattern is valid"))
}

/// Checks a table of contents before it is attached to a completed document.
///
/// Walks the tree iteratively so arbitrarily deep outlines cannot overflow
/// the stack.
pub fn validate_structure(structure: &[ChapterNode]) -> Result<(), ValidationError> {
    if structure.is_empty() {
        return Err(ValidationError::EmptyStructure);
    }

    let mut seen = HashSet::new();
    let mut stack: Vec<&ChapterNode> = structure.iter().rev().collect();

    while let Some(node) = stack.pop() {
        if !slug_pattern().is_match(&node.slug) {
            return Err(ValidationError::InvalidSlug {
                slug: node.slug.clone(),
            });
        }
        if node.title.trim().is_empty() {
            return Err(ValidationError::MissingChapterTitle {
                slug: node.slug.clone(),
            });
        }
        if !seen.insert(node.slug.as_str()) {
            return Err(ValidationError::DuplicateSlug {
                slug: node.slug.clone(),
            });
        }
        stack.extend(node.children.iter().rev());
    }

    Ok(())
}

/// Derives a URL-safe slug from a chapter title.
///
/// "Intro to Variables!" becomes "intro-to-variables". Titles with no usable
/// characters fall back to "chapter".
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_dash = false;

    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }

    if slug.is_empty() {
        "chapter".to_string()
    } else {
        slug
    }
}

/// Input from the upload boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDocument {
    pub owner_id: String,
    pub title: String,
    pub source_location: String,
    #[serde(default)]
    pub is_public: bool,
}

impl NewDocument {
    pub fn new(
        owner_id: impl Into<String>,
        title: impl Into<String>,
        source_location: impl Into<String>,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            title: title.into(),
            source_location: source_location.into(),
            is_public: false,
        }
    }

    /// Returns a trimmed copy, or the first missing field.
    pub fn validate(&self) -> Result<NewDocument, ValidationError> {
        let title = self.title.trim();
        if title.is_empty() {
            return Err(ValidationError::MissingTitle);
        }
        let owner_id = self.owner_id.trim();
        if owner_id.is_empty() {
            return Err(ValidationError::MissingOwner);
        }
        let source_location = self.source_location.trim();
        if source_location.is_empty() {
            return Err(ValidationError::MissingSourceLocation);
        }

        Ok(NewDocument {
            owner_id: owner_id.to_string(),
            title: title.to_string(),
            source_location: source_location.to_string(),
            is_public: self.is_public,
        })
    }
}

/// Durable record of an uploaded document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRecord {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    pub source_location: String,
    pub processing_state: ProcessingState,
    /// Present exactly when `processing_state` is `completed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structure: Option<Vec<ChapterNode>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub is_public: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentRecord {
    /// Builds a fresh `pending` record. `input` must already be validated.
    pub(crate) fn pending(input: NewDocument, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: input.owner_id,
            title: input.title,
            source_location: input.source_location,
            processing_state: ProcessingState::Pending,
            structure: None,
            page_count: None,
            failure_reason: None,
            is_public: input.is_public,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use ProcessingState::*;

        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Processing));
        assert!(!Processing.can_transition_to(Pending));
    }

    #[test]
    fn test_state_round_trips_through_str() {
        for state in [
            ProcessingState::Pending,
            ProcessingState::Processing,
            ProcessingState::Completed,
            ProcessingState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<ProcessingState>().unwrap(), state);
        }
        assert!("done".parse::<ProcessingState>().is_err());
    }

    #[test]
    fn test_state_serializes_lowercase() {
        let json = serde_json::to_string(&ProcessingState::Processing).unwrap();
        assert_eq!(json, "\"processing\"");
    }

    #[test]
    fn test_validate_structure_accepts_nested_tree() {
        let structure = vec![
            ChapterNode::new("Cells", "cells")
                .with_page_start(1)
                .with_children(vec![
                    ChapterNode::new("Membranes", "membranes").with_page_start(3),
                    ChapterNode::new("Organelles", "organelles")
                        .with_children(vec![ChapterNode::new("Mitochondria", "mitochondria")]),
                ]),
            ChapterNode::new("Genetics", "genetics").with_content("DNA and heredity"),
        ];
        assert!(validate_structure(&structure).is_ok());
    }

    #[test]
    fn test_validate_structure_rejects_empty() {
        assert_eq!(validate_structure(&[]), Err(ValidationError::EmptyStructure));
    }

    #[test]
    fn test_validate_structure_rejects_nested_duplicate_slug() {
        let structure = vec![
            ChapterNode::new("Intro", "intro"),
            ChapterNode::new("Part 2", "part-2")
                .with_children(vec![ChapterNode::new("Intro again", "intro")]),
        ];
        assert_eq!(
            validate_structure(&structure),
            Err(ValidationError::DuplicateSlug {
                slug: "intro".to_string()
            })
        );
    }

    #[test]
    fn test_validate_structure_rejects_unsafe_slug() {
        let structure = vec![ChapterNode::new("Intro", "intro/../x")];
        assert!(matches!(
            validate_structure(&structure),
            Err(ValidationError::InvalidSlug { .. })
        ));
    }

    #[test]
    fn test_validate_structure_rejects_blank_title() {
        let structure = vec![ChapterNode::new("  ", "blank")];
        assert!(matches!(
            validate_structure(&structure),
            Err(ValidationError::MissingChapterTitle { .. })
        ));
    }

    #[test]
    fn test_validate_structure_handles_deep_nesting() {
        let mut node = ChapterNode::new("Leaf", "n-0");
        for depth in 1..1_000 {
            node = ChapterNode::new("Level", format!("n-{}", depth)).with_children(vec![node]);
        }
        assert!(validate_structure(&[node]).is_ok());
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Intro to Variables!"), "intro-to-variables");
        assert_eq!(slugify("  Chapter 1: Cells  "), "chapter-1-cells");
        assert_eq!(slugify("***"), "chapter");
        assert_eq!(slugify("Ünïcode Title"), "n-code-title");
    }

    #[test]
    fn test_chapter_json_uses_original_field_names() {
        let node = ChapterNode::new("Ch1", "ch1").with_page_start(7);
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["pageStart"], 7);
        assert_eq!(json["children"], serde_json::json!([]));
        assert!(json.get("content").is_none());

        let parsed: ChapterNode =
            serde_json::from_str(r#"{"title":"Ch1","slug":"ch1"}"#).unwrap();
        assert!(parsed.children.is_empty());
        assert!(parsed.page_start.is_none());
    }

    #[test]
    fn test_new_document_validation() {
        assert_eq!(
            NewDocument::new("u1", "  ", "file://a.pdf").validate().unwrap_err(),
            ValidationError::MissingTitle
        );
        assert_eq!(
            NewDocument::new("", "Bio 101", "file://a.pdf").validate().unwrap_err(),
            ValidationError::MissingOwner
        );
        assert_eq!(
            NewDocument::new("u1", "Bio 101", "").validate().unwrap_err(),
            ValidationError::MissingSourceLocation
        );

        let ok = NewDocument::new(" u1 ", " Bio 101 ", " file://bio101.pdf ")
            .validate()
            .unwrap();
        assert_eq!(ok.title, "Bio 101");
        assert_eq!(ok.owner_id, "u1");
        assert_eq!(ok.source_location, "file://bio101.pdf");
    }

    #[test]
    fn test_pending_record() {
        let input = NewDocument::new("u1", "Bio 101", "file://bio101.pdf");
        let now = Utc::now();
        let record = DocumentRecord::pending(input, now);

        assert!(!record.id.is_empty());
        assert_eq!(record.processing_state, ProcessingState::Pending);
        assert!(record.structure.is_none());
        assert!(record.page_count.is_none());
        assert_eq!(record.created_at, now);
    }
}
