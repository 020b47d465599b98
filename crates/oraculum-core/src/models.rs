//! Core data models shared by the ingestion, retrieval, and chat pipelines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A normalized document, ready for chunking.
///
/// Produced by a normalizer from uploaded bytes. Immutable once built;
/// the index keeps only its [`DocumentMeta`].
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    /// Source filename, used for attribution in retrieved context.
    pub source: String,
    pub content_type: String,
    /// Canonical plain-text / markdown body.
    pub text: String,
    /// SHA-256 of `text`.
    pub content_hash: String,
    /// Unix seconds.
    pub created_at: i64,
}

impl Document {
    /// Build a document with a fresh UUID and content hash.
    pub fn new(source: &str, content_type: &str, text: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source: source.to_string(),
            content_type: content_type.to_string(),
            content_hash: sha256_hex(&text),
            text,
            created_at: Utc::now().timestamp(),
        }
    }

    pub fn meta(&self) -> DocumentMeta {
        DocumentMeta {
            id: self.id.clone(),
            source: self.source.clone(),
            content_type: self.content_type.clone(),
            content_hash: self.content_hash.clone(),
            created_at: self.created_at,
        }
    }
}

/// Document metadata kept by the vector index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub id: String,
    pub source: String,
    pub content_type: String,
    pub content_hash: String,
    pub created_at: i64,
}

/// A contiguous slice of a document's text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    /// Back-reference to the owning [`Document`].
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub hash: String,
}

/// A chunk together with the embedding it was indexed under.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub chunk: Chunk,
    pub embedding: Vec<f32>,
}

/// One k-NN result. The score is computed per query and never stored.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub chunk: Chunk,
    /// Filename of the document the chunk came from.
    pub source: String,
    /// Cosine similarity in `[-1.0, 1.0]`.
    pub score: f32,
}

/// Who authored a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Human,
    Assistant,
}

/// One conversation message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn human(content: impl Into<String>) -> Self {
        Self {
            role: Role::Human,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

pub(crate) fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
