//! Ingestion: files and uploaded bytes → normalized documents → index.
//!
//! Normalization is CPU-bound (PDF and OOXML parsing), so it runs on the
//! blocking pool. Failures are per document: a bad file in a directory walk
//! is reported in [`IngestReport::failed`] and the walk continues.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use oraculum_core::index::VectorIndex;
use oraculum_core::{RagError, RagResult};

use crate::config::IngestConfig;
use crate::normalize::NormalizerRegistry;

/// One successfully indexed document.
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub document_id: String,
    pub source: String,
    pub content_type: String,
    pub chunks: usize,
}

/// One file that could not be ingested.
#[derive(Debug, Clone, Serialize)]
pub struct IngestFailure {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub ingested: Vec<IngestOutcome>,
    pub failed: Vec<IngestFailure>,
    /// Files passed over: unsupported extension or over the size limit.
    pub skipped: usize,
}

impl IngestReport {
    pub fn chunks(&self) -> usize {
        self.ingested.iter().map(|o| o.chunks).sum()
    }
}

/// Normalize `bytes` as `name` and add the result to the index.
pub async fn ingest_bytes(
    index: &VectorIndex,
    registry: &Arc<NormalizerRegistry>,
    bytes: Vec<u8>,
    name: &str,
) -> RagResult<IngestOutcome> {
    let registry = Arc::clone(registry);
    let owned_name = name.to_string();
    let document = tokio::task::spawn_blocking(move || registry.normalize(bytes, &owned_name))
        .await
        .map_err(|e| RagError::Conversion(format!("{}: normalizer task failed: {}", name, e)))??;

    let chunks = index.add(&document).await?;
    Ok(IngestOutcome {
        document_id: document.id.clone(),
        source: document.source.clone(),
        content_type: document.content_type.clone(),
        chunks: chunks.len(),
    })
}

/// Read a file and ingest it under `name` (defaults to the file name).
pub async fn ingest_path(
    index: &VectorIndex,
    registry: &Arc<NormalizerRegistry>,
    path: &Path,
    name: Option<&str>,
) -> Result<IngestOutcome> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let name = match name {
        Some(n) => n.to_string(),
        None => path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string()),
    };
    let outcome = ingest_bytes(index, registry, bytes, &name).await?;
    Ok(outcome)
}

/// Walk `root`, ingesting every supported file that matches the globs.
///
/// Sources are recorded relative to `root`, so files with the same name in
/// different directories stay distinct.
pub async fn ingest_dir(
    index: &VectorIndex,
    registry: &Arc<NormalizerRegistry>,
    root: &Path,
    config: &IngestConfig,
) -> Result<IngestReport> {
    let walk_root = root.to_path_buf();
    let walk_config = config.clone();
    let walk_registry = Arc::clone(registry);
    let (files, skipped) = tokio::task::spawn_blocking(move || {
        scan_dir(&walk_root, &walk_config, &walk_registry)
    })
    .await??;

    let mut report = IngestReport {
        skipped,
        ..Default::default()
    };

    for (path, relative) in files {
        match ingest_path(index, registry, &path, Some(&relative)).await {
            Ok(outcome) => {
                debug!(source = %outcome.source, chunks = outcome.chunks, "ingested");
                report.ingested.push(outcome);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %format!("{:#}", e), "ingest failed");
                report.failed.push(IngestFailure {
                    path: relative,
                    error: format!("{:#}", e),
                });
            }
        }
    }

    info!(
        root = %root.display(),
        ingested = report.ingested.len(),
        failed = report.failed.len(),
        skipped = report.skipped,
        "directory ingested"
    );
    Ok(report)
}

/// Collect `(absolute, relative)` paths to ingest, sorted for determinism.
fn scan_dir(
    root: &Path,
    config: &IngestConfig,
    registry: &NormalizerRegistry,
) -> Result<(Vec<(PathBuf, String)>, usize)> {
    if !root.is_dir() {
        anyhow::bail!("Not a directory: {}", root.display());
    }

    let include_set = build_globset(&config.include_globs)?;
    let mut excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    excludes.extend(config.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let mut files = Vec::new();
    let mut skipped = 0usize;
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }
        if !registry.supports(&rel_str) {
            skipped += 1;
            continue;
        }
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        if size > config.max_file_bytes {
            warn!(path = %rel_str, size, "file exceeds max_file_bytes, skipped");
            skipped += 1;
            continue;
        }
        files.push((path.to_path_buf(), rel_str));
    }

    files.sort_by(|a, b| a.1.cmp(&b.1));
    Ok((files, skipped))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use oraculum_core::embedding::HashEmbedder;
    use oraculum_core::index::IndexOptions;
    use tempfile::TempDir;

    fn setup() -> (VectorIndex, Arc<NormalizerRegistry>) {
        (
            VectorIndex::new(Arc::new(HashEmbedder::new(64)), IndexOptions::default()),
            Arc::new(NormalizerRegistry::with_builtins()),
        )
    }

    #[tokio::test]
    async fn test_ingest_bytes_indexes_document() {
        let (index, registry) = setup();
        let outcome = ingest_bytes(
            &index,
            &registry,
            b"O Congresso Nacional fica na Esplanada.".to_vec(),
            "congresso.txt",
        )
        .await
        .unwrap();
        assert_eq!(outcome.source, "congresso.txt");
        assert_eq!(outcome.chunks, 1);
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn test_ingest_bytes_unsupported_leaves_index_empty() {
        let (index, registry) = setup();
        let err = ingest_bytes(&index, &registry, vec![1, 2, 3], "x.bin")
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::UnsupportedFormat(_)));
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn test_ingest_dir_reports_per_file() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("guias")).unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::write(root.join("guias/catedral.md"), "# Catedral\n\nNiemeyer.").unwrap();
        std::fs::write(root.join("torre.txt"), "Torre de TV").unwrap();
        std::fs::write(root.join("quebrado.txt"), [0xffu8, 0xfe]).unwrap();
        std::fs::write(root.join("foto.png"), [0u8; 4]).unwrap();
        std::fs::write(root.join(".git/config.txt"), "ignored").unwrap();

        let (index, registry) = setup();
        let report = ingest_dir(&index, &registry, root, &IngestConfig::default())
            .await
            .unwrap();

        let sources: Vec<&str> = report.ingested.iter().map(|o| o.source.as_str()).collect();
        assert_eq!(sources, vec!["guias/catedral.md", "torre.txt"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].path, "quebrado.txt");
        assert_eq!(report.skipped, 1);
        assert_eq!(index.documents().len(), 2);
    }

    #[tokio::test]
    async fn test_ingest_dir_respects_exclude_globs() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.md"), "alfa").unwrap();
        std::fs::write(tmp.path().join("b.md"), "beta").unwrap();
        let config = IngestConfig {
            exclude_globs: vec!["b.*".to_string()],
            ..Default::default()
        };
        let (index, registry) = setup();
        let report = ingest_dir(&index, &registry, tmp.path(), &config).await.unwrap();
        assert_eq!(report.ingested.len(), 1);
        assert_eq!(report.ingested[0].source, "a.md");
    }
}
