//! Error taxonomy for the RAG pipeline.
//!
//! Every failure that crosses a pipeline boundary (ingestion, query,
//! persistence, synthesis) is reported as a [`RagError`]. Backends
//! themselves speak `anyhow`; the boundary that calls them decides which
//! variant the failure becomes.

use thiserror::Error;

/// A failure scoped to the single operation that raised it.
#[derive(Debug, Error)]
pub enum RagError {
    /// No normalizer is registered for the file's extension.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// The file claimed a supported format but its content could not be converted.
    #[error("conversion failed: {0}")]
    Conversion(String),

    /// The embedding backend failed or returned an unusable vector.
    #[error("embedding failed: {0}")]
    Embedding(String),

    /// The query cannot be answered as asked (empty index, `k == 0`, blank text).
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// A persisted index failed validation while loading.
    #[error("index corrupted: {0}")]
    IndexCorruption(String),

    /// The chat-completion endpoint failed before or during streaming.
    #[error("completion endpoint error: {0}")]
    CompletionEndpoint(String),

    /// A session lookup missed. Get-or-create semantics make this an
    /// internal invariant violation.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// A turn is already running for this session.
    #[error("a turn is already in progress for session {0}")]
    TurnInProgress(String),
}

impl RagError {
    /// Machine-readable code used by the HTTP error contract.
    pub fn code(&self) -> &'static str {
        match self {
            RagError::UnsupportedFormat(_) => "unsupported_format",
            RagError::Conversion(_) => "conversion_failed",
            RagError::Embedding(_) => "embedding_failed",
            RagError::InvalidQuery(_) => "invalid_query",
            RagError::IndexCorruption(_) => "index_corrupted",
            RagError::CompletionEndpoint(_) => "completion_failed",
            RagError::SessionNotFound(_) => "internal",
            RagError::TurnInProgress(_) => "turn_in_progress",
        }
    }
}

pub type RagResult<T> = std::result::Result<T, RagError>;
