//! In-memory vector index over embedded chunks.
//!
//! The index owns a flat, append-ordered list of [`IndexEntry`] values plus
//! the metadata of every document they came from. Search is brute-force
//! cosine similarity, which is exact and keeps results reproducible across
//! a save/load round trip.
//!
//! # Atomicity
//!
//! [`VectorIndex::add`] does all of its slow work (chunking, embedding,
//! validation) before touching shared state, then inserts every chunk of
//! the document under a single write-lock acquisition. A failure at any
//! point before that leaves the index exactly as it was, so a document is
//! either fully indexed or absent.
//!
//! # Concurrency
//!
//! Entries live behind an `RwLock` that is never held across an `.await`.
//! Searches share the read lock; an `add` holds the write lock only for
//! the in-memory insert. Existing entries are never mutated in place.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info};

use crate::chunk::chunk_text;
use crate::embedding::{cosine_similarity, Embedder};
use crate::error::{RagError, RagResult};
use crate::models::{Chunk, Document, DocumentMeta, IndexEntry, SearchHit};

/// Chunking and batching parameters for [`VectorIndex::add`].
#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// Maximum tokens per chunk (≈ 4 chars per token).
    pub max_tokens: usize,
    /// Tokens of trailing context repeated at the start of the next chunk.
    pub overlap_tokens: usize,
    /// Chunks per embedding call.
    pub batch_size: usize,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            max_tokens: 700,
            overlap_tokens: 80,
            batch_size: 64,
        }
    }
}

#[derive(Default)]
struct IndexState {
    documents: HashMap<String, DocumentMeta>,
    entries: Vec<IndexEntry>,
    dims: Option<usize>,
}

/// A point-in-time copy of the index contents, used for persistence.
#[derive(Debug, Clone, Default)]
pub struct IndexSnapshot {
    /// Documents sorted by `(created_at, id)`.
    pub documents: Vec<DocumentMeta>,
    /// Entries in insertion order.
    pub entries: Vec<IndexEntry>,
}

/// Vector index with a pluggable [`Embedder`].
pub struct VectorIndex {
    embedder: Arc<dyn Embedder>,
    options: IndexOptions,
    state: RwLock<IndexState>,
}

impl VectorIndex {
    pub fn new(embedder: Arc<dyn Embedder>, options: IndexOptions) -> Self {
        Self {
            embedder,
            options,
            state: RwLock::new(IndexState::default()),
        }
    }

    /// Rebuild an index from persisted contents.
    ///
    /// Re-validates every invariant the live index maintains: each vector
    /// is finite and has the embedder's dimensionality, and each chunk
    /// references a known document.
    pub fn restore(
        embedder: Arc<dyn Embedder>,
        options: IndexOptions,
        snapshot: IndexSnapshot,
    ) -> RagResult<Self> {
        let dims = embedder.dims();
        let mut documents = HashMap::with_capacity(snapshot.documents.len());
        for doc in snapshot.documents {
            if documents.insert(doc.id.clone(), doc).is_some() {
                return Err(RagError::IndexCorruption(
                    "duplicate document id".to_string(),
                ));
            }
        }

        for entry in &snapshot.entries {
            if !documents.contains_key(&entry.chunk.document_id) {
                return Err(RagError::IndexCorruption(format!(
                    "chunk {} references unknown document {}",
                    entry.chunk.id, entry.chunk.document_id
                )));
            }
            validate_vector(&entry.embedding, dims)
                .map_err(|e| RagError::IndexCorruption(format!("chunk {}: {}", entry.chunk.id, e)))?;
        }

        let state = IndexState {
            dims: if snapshot.entries.is_empty() {
                None
            } else {
                Some(dims)
            },
            documents,
            entries: snapshot.entries,
        };

        Ok(Self {
            embedder,
            options,
            state: RwLock::new(state),
        })
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn options(&self) -> &IndexOptions {
        &self.options
    }

    /// Number of indexed chunks.
    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    /// Metadata of every indexed document, oldest first.
    pub fn documents(&self) -> Vec<DocumentMeta> {
        let mut docs: Vec<DocumentMeta> = self.read().documents.values().cloned().collect();
        docs.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        docs
    }

    /// Split, embed, and insert a document.
    ///
    /// If a document with the same `source` is already indexed, its chunks
    /// are replaced in the same atomic step. Returns the new chunks.
    ///
    /// # Errors
    ///
    /// - [`RagError::Conversion`] if the document has no indexable text.
    /// - [`RagError::Embedding`] if the embedder fails, returns the wrong
    ///   number of vectors, or returns an invalid vector. Nothing of the
    ///   document is indexed in that case.
    pub async fn add(&self, document: &Document) -> RagResult<Vec<Chunk>> {
        let chunks = chunk_text(
            &document.id,
            &document.text,
            self.options.max_tokens,
            self.options.overlap_tokens,
        );
        if chunks.is_empty() {
            return Err(RagError::Conversion(format!(
                "{} has no indexable text",
                document.source
            )));
        }

        let dims = self.embedder.dims();
        let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(self.options.batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let batch_vecs = self
                .embedder
                .embed(&texts)
                .await
                .map_err(|e| RagError::Embedding(format!("{:#}", e)))?;
            if batch_vecs.len() != texts.len() {
                return Err(RagError::Embedding(format!(
                    "embedder returned {} vectors for {} texts",
                    batch_vecs.len(),
                    texts.len()
                )));
            }
            for v in &batch_vecs {
                validate_vector(v, dims).map_err(RagError::Embedding)?;
            }
            vectors.extend(batch_vecs);
        }

        let mut state = self.write();
        if let Some(existing) = state.dims {
            if existing != dims {
                return Err(RagError::Embedding(format!(
                    "index holds {}-dimensional vectors, embedder produces {}",
                    existing, dims
                )));
            }
        }

        let replaced: Vec<String> = state
            .documents
            .values()
            .filter(|d| d.source == document.source)
            .map(|d| d.id.clone())
            .collect();
        if !replaced.is_empty() {
            state
                .entries
                .retain(|e| !replaced.contains(&e.chunk.document_id));
            for id in &replaced {
                state.documents.remove(id);
            }
            debug!(source = %document.source, "replacing previously indexed document");
        }

        state
            .documents
            .insert(document.id.clone(), document.meta());
        state
            .entries
            .extend(chunks.iter().cloned().zip(vectors).map(|(chunk, embedding)| {
                IndexEntry { chunk, embedding }
            }));
        state.dims = Some(dims);

        info!(
            source = %document.source,
            chunks = chunks.len(),
            total = state.entries.len(),
            "document indexed"
        );
        Ok(chunks)
    }

    /// Return the `k` chunks most similar to `query`, best first.
    ///
    /// Ties keep insertion order, so results are deterministic.
    ///
    /// # Errors
    ///
    /// - [`RagError::InvalidQuery`] if `k == 0`, the query is blank, or the
    ///   index is empty.
    /// - [`RagError::Embedding`] if the query cannot be embedded.
    pub async fn search(&self, query: &str, k: usize) -> RagResult<Vec<SearchHit>> {
        if k == 0 {
            return Err(RagError::InvalidQuery("k must be a positive integer".to_string()));
        }
        if query.trim().is_empty() {
            return Err(RagError::InvalidQuery("query must not be empty".to_string()));
        }
        if self.is_empty() {
            return Err(RagError::InvalidQuery("the index is empty".to_string()));
        }

        let query_vec = self
            .embedder
            .embed(&[query.to_string()])
            .await
            .map_err(|e| RagError::Embedding(format!("{:#}", e)))?
            .into_iter()
            .next()
            .ok_or_else(|| RagError::Embedding("empty embedding response".to_string()))?;
        validate_vector(&query_vec, self.embedder.dims()).map_err(RagError::Embedding)?;

        let state = self.read();
        if state.entries.is_empty() {
            return Err(RagError::InvalidQuery("the index is empty".to_string()));
        }

        let mut scored: Vec<(usize, f32)> = state
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (i, cosine_similarity(&query_vec, &e.embedding)))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(k);

        let hits = scored
            .into_iter()
            .map(|(i, score)| {
                let entry = &state.entries[i];
                let source = state
                    .documents
                    .get(&entry.chunk.document_id)
                    .map(|d| d.source.clone())
                    .unwrap_or_default();
                SearchHit {
                    chunk: entry.chunk.clone(),
                    source,
                    score,
                }
            })
            .collect();
        Ok(hits)
    }

    /// Remove every chunk of the document(s) named `source`.
    ///
    /// Returns the number of chunks removed.
    pub fn remove_source(&self, source: &str) -> usize {
        let mut state = self.write();
        let ids: Vec<String> = state
            .documents
            .values()
            .filter(|d| d.source == source)
            .map(|d| d.id.clone())
            .collect();
        let before = state.entries.len();
        state.entries.retain(|e| !ids.contains(&e.chunk.document_id));
        for id in &ids {
            state.documents.remove(id);
        }
        if state.entries.is_empty() {
            state.dims = None;
        }
        before - state.entries.len()
    }

    /// Copy the current contents for persistence.
    pub fn snapshot(&self) -> IndexSnapshot {
        let state = self.read();
        let mut documents: Vec<DocumentMeta> = state.documents.values().cloned().collect();
        documents.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        IndexSnapshot {
            documents,
            entries: state.entries.clone(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn validate_vector(v: &[f32], dims: usize) -> Result<(), String> {
    if v.is_empty() {
        return Err("empty embedding vector".to_string());
    }
    if v.len() != dims {
        return Err(format!("expected {} dimensions, got {}", dims, v.len()));
    }
    if v.iter().any(|x| !x.is_finite()) {
        return Err("embedding contains non-finite values".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn index() -> VectorIndex {
        VectorIndex::new(
            Arc::new(HashEmbedder::new(128)),
            IndexOptions {
                max_tokens: 16,
                overlap_tokens: 0,
                batch_size: 2,
            },
        )
    }

    /// Fails on the n-th embed call (1-based).
    struct FailingEmbedder {
        inner: HashEmbedder,
        fail_on_call: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for FailingEmbedder {
        fn model_name(&self) -> &str {
            "failing"
        }
        fn dims(&self) -> usize {
            self.inner.dims()
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call == self.fail_on_call {
                bail!("backend unavailable");
            }
            self.inner.embed(texts).await
        }
    }

    struct WrongDimsEmbedder;

    #[async_trait]
    impl Embedder for WrongDimsEmbedder {
        fn model_name(&self) -> &str {
            "wrong"
        }
        fn dims(&self) -> usize {
            8
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.5; 4]).collect())
        }
    }

    fn long_doc(source: &str) -> Document {
        let text = (0..12)
            .map(|i| format!("Paragraph {} describes the Esplanada dos Ministérios.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        Document::new(source, "text/plain", text)
    }

    #[tokio::test]
    async fn test_search_on_empty_index_is_invalid_query() {
        let idx = index();
        let err = idx.search("Brasília", 10).await.unwrap_err();
        assert!(matches!(err, RagError::InvalidQuery(_)));
    }

    #[tokio::test]
    async fn test_search_rejects_zero_k_and_blank_query() {
        let idx = index();
        idx.add(&Document::new("a.md", "text/markdown", "Lago Paranoá".into()))
            .await
            .unwrap();
        assert!(matches!(
            idx.search("lago", 0).await.unwrap_err(),
            RagError::InvalidQuery(_)
        ));
        assert!(matches!(
            idx.search("   ", 3).await.unwrap_err(),
            RagError::InvalidQuery(_)
        ));
    }

    #[tokio::test]
    async fn test_add_then_search_finds_source() {
        let idx = index();
        let doc = Document::new(
            "catedral.md",
            "text/markdown",
            "A Catedral Metropolitana foi projetada por Oscar Niemeyer.".into(),
        );
        idx.add(&doc).await.unwrap();
        idx.add(&Document::new(
            "lago.md",
            "text/markdown",
            "O Lago Paranoá é um lago artificial.".into(),
        ))
        .await
        .unwrap();

        let hits = idx.search("Catedral Metropolitana", 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source, "catedral.md");
        assert_eq!(hits[0].chunk.document_id, doc.id);
    }

    #[tokio::test]
    async fn test_results_are_sorted_and_truncated() {
        let idx = index();
        idx.add(&long_doc("esplanada.md")).await.unwrap();
        let hits = idx.search("Esplanada", 3).await.unwrap();
        assert_eq!(hits.len(), 3);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));

        let all = idx.search("Esplanada", 1000).await.unwrap();
        assert_eq!(all.len(), idx.len());
    }

    #[tokio::test]
    async fn test_embedding_failure_mid_batch_leaves_no_chunks() {
        let idx = VectorIndex::new(
            Arc::new(FailingEmbedder {
                inner: HashEmbedder::new(64),
                fail_on_call: 2,
                calls: AtomicUsize::new(0),
            }),
            IndexOptions {
                max_tokens: 16,
                overlap_tokens: 0,
                batch_size: 2,
            },
        );
        let doc = long_doc("falha.md");
        let err = idx.add(&doc).await.unwrap_err();
        assert!(matches!(err, RagError::Embedding(_)));
        assert_eq!(idx.len(), 0);
        assert!(idx.documents().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_dimension_is_rejected() {
        let idx = VectorIndex::new(Arc::new(WrongDimsEmbedder), IndexOptions::default());
        let err = idx
            .add(&Document::new("x.txt", "text/plain", "texto".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Embedding(_)));
        assert!(idx.is_empty());
    }

    #[tokio::test]
    async fn test_readding_same_source_replaces_chunks() {
        let idx = index();
        idx.add(&Document::new("guia.md", "text/markdown", "versão antiga".into()))
            .await
            .unwrap();
        idx.add(&Document::new("guia.md", "text/markdown", "versão nova".into()))
            .await
            .unwrap();
        assert_eq!(idx.documents().len(), 1);
        assert_eq!(idx.len(), 1);
        let hits = idx.search("versão", 5).await.unwrap();
        assert_eq!(hits[0].chunk.text, "versão nova");
    }

    #[tokio::test]
    async fn test_blank_document_is_conversion_error() {
        let idx = index();
        let err = idx
            .add(&Document::new("vazio.txt", "text/plain", "\n\n".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Conversion(_)));
    }

    #[tokio::test]
    async fn test_remove_source() {
        let idx = index();
        idx.add(&long_doc("a.md")).await.unwrap();
        idx.add(&Document::new("b.md", "text/markdown", "Ponte JK".into()))
            .await
            .unwrap();
        let removed = idx.remove_source("a.md");
        assert!(removed > 0);
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.documents()[0].source, "b.md");
    }

    #[tokio::test]
    async fn test_restore_preserves_results() {
        let idx = index();
        idx.add(&long_doc("a.md")).await.unwrap();
        idx.add(&Document::new("b.md", "text/markdown", "Torre de TV".into()))
            .await
            .unwrap();
        let before = idx.search("Torre Esplanada", 5).await.unwrap();

        let restored = VectorIndex::restore(
            idx.embedder().clone(),
            idx.options().clone(),
            idx.snapshot(),
        )
        .unwrap();
        let after = restored.search("Torre Esplanada", 5).await.unwrap();

        assert_eq!(before.len(), after.len());
        for (a, b) in before.iter().zip(after.iter()) {
            assert_eq!(a.chunk, b.chunk);
            assert_eq!(a.source, b.source);
            assert_eq!(a.score.to_bits(), b.score.to_bits());
        }
    }

    #[test]
    fn test_restore_rejects_dangling_chunk() {
        let snapshot = IndexSnapshot {
            documents: Vec::new(),
            entries: vec![IndexEntry {
                chunk: Chunk {
                    id: "c1".into(),
                    document_id: "missing".into(),
                    chunk_index: 0,
                    text: "x".into(),
                    hash: "h".into(),
                },
                embedding: vec![0.1; 16],
            }],
        };
        let err = VectorIndex::restore(
            Arc::new(HashEmbedder::new(16)),
            IndexOptions::default(),
            snapshot,
        )
        .err()
        .unwrap();
        assert!(matches!(err, RagError::IndexCorruption(_)));
    }
}
