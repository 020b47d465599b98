//! Save and load a [`VectorIndex`] as a SQLite file.
//!
//! # Layout
//!
//! | Table | Contents |
//! |-------|----------|
//! | `meta` | `format_version`, `embedding_model`, `embedding_dims`, `saved_at` |
//! | `documents` | one row per [`DocumentMeta`] |
//! | `chunks` | chunk rows plus `position`, the entry's insertion slot |
//! | `chunk_vectors` | little-endian `f32` BLOB per chunk |
//!
//! Vectors are stored bit-exact, so a save/load round trip answers every
//! query with the same hits, scores and tie order.
//!
//! # Atomic replace
//!
//! [`save_index`] writes a complete file at `<path>.tmp` and renames it over
//! `<path>`. A crash mid-save leaves the previous index untouched.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::info;

use oraculum_core::embedding::{blob_to_vec, vec_to_blob, Embedder};
use oraculum_core::index::{IndexOptions, IndexSnapshot, VectorIndex};
use oraculum_core::models::{Chunk, DocumentMeta, IndexEntry};
use oraculum_core::{RagError, RagResult};

use crate::db;
use crate::migrate::{create_schema, FORMAT_VERSION};

/// What [`save_index`] wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveReport {
    pub documents: usize,
    pub chunks: usize,
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

/// Write the index to `path`, replacing any previous file atomically.
pub async fn save_index(index: &VectorIndex, path: &Path) -> Result<SaveReport> {
    let snapshot = index.snapshot();
    let tmp = tmp_path(path);
    if tmp.exists() {
        tokio::fs::remove_file(&tmp)
            .await
            .with_context(|| format!("Failed to remove stale {}", tmp.display()))?;
    }

    let pool = db::connect(&tmp, true).await?;
    let written = write_snapshot(&pool, index.embedder().as_ref(), &snapshot).await;
    pool.close().await;
    if let Err(e) = written {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }

    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to move {} into place", tmp.display()))?;

    let report = SaveReport {
        documents: snapshot.documents.len(),
        chunks: snapshot.entries.len(),
    };
    info!(
        path = %path.display(),
        documents = report.documents,
        chunks = report.chunks,
        "index saved"
    );
    Ok(report)
}

async fn write_snapshot(
    pool: &SqlitePool,
    embedder: &dyn Embedder,
    snapshot: &IndexSnapshot,
) -> Result<()> {
    create_schema(pool).await?;
    let mut tx = pool.begin().await?;

    let meta = [
        ("format_version", FORMAT_VERSION.to_string()),
        ("embedding_model", embedder.model_name().to_string()),
        ("embedding_dims", embedder.dims().to_string()),
        ("saved_at", Utc::now().timestamp().to_string()),
    ];
    for (key, value) in meta {
        sqlx::query("INSERT INTO meta (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
    }

    for doc in &snapshot.documents {
        sqlx::query(
            "INSERT INTO documents (id, source, content_type, content_hash, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&doc.id)
        .bind(&doc.source)
        .bind(&doc.content_type)
        .bind(&doc.content_hash)
        .bind(doc.created_at)
        .execute(&mut *tx)
        .await?;
    }

    for (position, entry) in snapshot.entries.iter().enumerate() {
        let chunk = &entry.chunk;
        sqlx::query(
            "INSERT INTO chunks (id, document_id, chunk_index, position, text, hash) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(chunk.chunk_index)
        .bind(position as i64)
        .bind(&chunk.text)
        .bind(&chunk.hash)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO chunk_vectors (chunk_id, embedding) VALUES (?, ?)")
            .bind(&chunk.id)
            .bind(vec_to_blob(&entry.embedding))
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Load an index saved by [`save_index`].
///
/// A missing file yields an empty index.
///
/// # Errors
///
/// [`RagError::IndexCorruption`] if the file is unreadable, has an unknown
/// format version, was built with a different embedding model or
/// dimensionality, or fails any index invariant.
pub async fn load_index(
    path: &Path,
    embedder: Arc<dyn Embedder>,
    options: IndexOptions,
) -> RagResult<VectorIndex> {
    if !path.exists() {
        info!(path = %path.display(), "no saved index, starting empty");
        return Ok(VectorIndex::new(embedder, options));
    }

    let pool = db::connect(path, false)
        .await
        .map_err(|e| corrupt(format!("cannot open {}: {:#}", path.display(), e)))?;
    let snapshot = read_snapshot(&pool, embedder.as_ref()).await;
    pool.close().await;
    let snapshot = snapshot?;

    let index = VectorIndex::restore(embedder, options, snapshot)?;
    info!(
        path = %path.display(),
        documents = index.documents().len(),
        chunks = index.len(),
        "index loaded"
    );
    Ok(index)
}

fn corrupt(message: impl Into<String>) -> RagError {
    RagError::IndexCorruption(message.into())
}

fn sql(e: sqlx::Error) -> RagError {
    corrupt(format!("unreadable index: {}", e))
}

async fn read_snapshot(pool: &SqlitePool, embedder: &dyn Embedder) -> RagResult<IndexSnapshot> {
    let meta: HashMap<String, String> = sqlx::query("SELECT key, value FROM meta")
        .fetch_all(pool)
        .await
        .map_err(sql)?
        .iter()
        .map(|row| Ok((row.try_get("key")?, row.try_get("value")?)))
        .collect::<Result<HashMap<String, String>, sqlx::Error>>()
        .map_err(sql)?;

    let version = meta.get("format_version").map(String::as_str);
    if version != Some(FORMAT_VERSION) {
        return Err(corrupt(format!(
            "unsupported format version {:?}, expected {}",
            version, FORMAT_VERSION
        )));
    }
    let model = meta.get("embedding_model").map(String::as_str);
    if model != Some(embedder.model_name()) {
        return Err(corrupt(format!(
            "index was built with embedding model {:?}, configured model is {}",
            model,
            embedder.model_name()
        )));
    }
    let dims = embedder.dims();
    let stored_dims = meta
        .get("embedding_dims")
        .and_then(|d| d.parse::<usize>().ok());
    if stored_dims != Some(dims) {
        return Err(corrupt(format!(
            "index holds {:?}-dimensional vectors, configured embedder produces {}",
            stored_dims, dims
        )));
    }

    let documents = sqlx::query(
        "SELECT id, source, content_type, content_hash, created_at FROM documents ORDER BY created_at, id",
    )
    .fetch_all(pool)
    .await
    .map_err(sql)?
    .iter()
    .map(|row| {
        Ok(DocumentMeta {
            id: row.try_get("id")?,
            source: row.try_get("source")?,
            content_type: row.try_get("content_type")?,
            content_hash: row.try_get("content_hash")?,
            created_at: row.try_get("created_at")?,
        })
    })
    .collect::<Result<Vec<_>, sqlx::Error>>()
    .map_err(sql)?;

    let rows = sqlx::query(
        r#"
        SELECT c.id, c.document_id, c.chunk_index, c.text, c.hash, v.embedding
        FROM chunks c
        LEFT JOIN chunk_vectors v ON v.chunk_id = c.id
        ORDER BY c.position ASC
        "#,
    )
    .fetch_all(pool)
    .await
    .map_err(sql)?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in &rows {
        let chunk = Chunk {
            id: row.try_get("id").map_err(sql)?,
            document_id: row.try_get("document_id").map_err(sql)?,
            chunk_index: row.try_get("chunk_index").map_err(sql)?,
            text: row.try_get("text").map_err(sql)?,
            hash: row.try_get("hash").map_err(sql)?,
        };
        let blob: Option<Vec<u8>> = row.try_get("embedding").map_err(sql)?;
        let blob = blob.ok_or_else(|| corrupt(format!("chunk {} has no vector", chunk.id)))?;
        if blob.len() != dims * 4 {
            return Err(corrupt(format!(
                "chunk {} vector is {} bytes, expected {}",
                chunk.id,
                blob.len(),
                dims * 4
            )));
        }
        entries.push(IndexEntry {
            embedding: blob_to_vec(&blob),
            chunk,
        });
    }

    Ok(IndexSnapshot { documents, entries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use oraculum_core::embedding::HashEmbedder;
    use oraculum_core::models::Document;
    use tempfile::TempDir;

    fn embedder() -> Arc<dyn Embedder> {
        Arc::new(HashEmbedder::new(64))
    }

    async fn sample_index() -> VectorIndex {
        let index = VectorIndex::new(embedder(), IndexOptions::default());
        index
            .add(&Document::new(
                "catedral.md",
                "text/markdown",
                "A Catedral de Brasília foi projetada por Oscar Niemeyer.".to_string(),
            ))
            .await
            .unwrap();
        index
            .add(&Document::new(
                "torre.md",
                "text/markdown",
                "A Torre de TV tem um mirante e uma feira de artesanato.".to_string(),
            ))
            .await
            .unwrap();
        index
    }

    #[tokio::test]
    async fn test_missing_file_loads_empty() {
        let tmp = TempDir::new().unwrap();
        let index = load_index(&tmp.path().join("none.sqlite"), embedder(), IndexOptions::default())
            .await
            .unwrap();
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn test_round_trip_is_exact() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("index.sqlite");
        let index = sample_index().await;

        let report = save_index(&index, &path).await.unwrap();
        assert_eq!(report.documents, 2);
        assert!(!tmp_path(&path).exists());

        let loaded = load_index(&path, embedder(), IndexOptions::default())
            .await
            .unwrap();
        assert_eq!(loaded.snapshot().entries, index.snapshot().entries);
        assert_eq!(loaded.documents(), index.documents());

        let before = index.search("Niemeyer catedral", 2).await.unwrap();
        let after = loaded.search("Niemeyer catedral", 2).await.unwrap();
        let key = |hits: &[oraculum_core::models::SearchHit]| {
            hits.iter()
                .map(|h| (h.chunk.id.clone(), h.score.to_bits()))
                .collect::<Vec<_>>()
        };
        assert_eq!(key(&before), key(&after));
    }

    #[tokio::test]
    async fn test_save_overwrites_previous_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("index.sqlite");
        let index = sample_index().await;
        save_index(&index, &path).await.unwrap();
        index.remove_source("torre.md");
        save_index(&index, &path).await.unwrap();

        let loaded = load_index(&path, embedder(), IndexOptions::default())
            .await
            .unwrap();
        assert_eq!(loaded.documents().len(), 1);
    }

    #[tokio::test]
    async fn test_model_mismatch_is_corruption() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("index.sqlite");
        save_index(&sample_index().await, &path).await.unwrap();

        let err = load_index(&path, Arc::new(HashEmbedder::new(32)), IndexOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RagError::IndexCorruption(_)));
    }

    #[tokio::test]
    async fn test_garbage_file_is_corruption() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("index.sqlite");
        std::fs::write(&path, b"definitely not sqlite").unwrap();
        let err = load_index(&path, embedder(), IndexOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RagError::IndexCorruption(_)));
    }

    #[tokio::test]
    async fn test_truncated_vector_is_corruption() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("index.sqlite");
        save_index(&sample_index().await, &path).await.unwrap();

        {
            let pool = db::connect(&path, true).await.unwrap();
            sqlx::query("UPDATE chunk_vectors SET embedding = x'0000'")
                .execute(&pool)
                .await
                .unwrap();
            pool.close().await;
        }

        let err = load_index(&path, embedder(), IndexOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RagError::IndexCorruption(_)));
    }
}
