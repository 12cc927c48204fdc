mod model;
mod service;

pub use model::{
    slugify, validate_structure, ChapterNode, DocumentRecord, NewDocument, ProcessingState,
};
pub use service::DocumentService;
