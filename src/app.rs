//! The application handle: every pipeline component wired from [`Config`].
//!
//! [`Oraculum`] is what the CLI and the HTTP server hold. It owns the vector
//! index, the session store (created once here, torn down by
//! [`Oraculum::shutdown`]), the normalizer registry and the orchestrator.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use oraculum_core::history::SessionStore;
use oraculum_core::index::VectorIndex;
use oraculum_core::models::{Message, SearchHit};
use oraculum_core::prompt::DEFAULT_SYSTEM_TEMPLATE;
use oraculum_core::RagResult;

use crate::chat::{ChatOptions, Orchestrator, TurnStream};
use crate::completion::{create_backend, CompletionBackend};
use crate::config::Config;
use crate::embedding::create_embedder;
use crate::ingest::{self, IngestOutcome, IngestReport};
use crate::normalize::NormalizerRegistry;
use crate::persist::{self, SaveReport};

pub struct Oraculum {
    config: Arc<Config>,
    index: Arc<VectorIndex>,
    sessions: Arc<SessionStore>,
    registry: Arc<NormalizerRegistry>,
    orchestrator: Orchestrator,
    save_lock: tokio::sync::Mutex<()>,
}

impl Oraculum {
    /// Build providers from config and load the saved index, if any.
    pub async fn open(config: Config) -> Result<Self> {
        let embedder = create_embedder(&config.embedding)?;
        let backend = create_backend(&config.completion)?;
        let index = match &config.index.path {
            Some(path) => persist::load_index(path, embedder, config.index_options())
                .await
                .with_context(|| format!("Failed to load index from {}", path.display()))?,
            None => VectorIndex::new(embedder, config.index_options()),
        };
        info!(
            embedder = %index.embedder().model_name(),
            completion = %backend.name(),
            chunks = index.len(),
            "oraculum ready"
        );
        Ok(Self::from_parts(config, Arc::new(index), backend))
    }

    /// Assemble from pre-built parts.
    pub fn from_parts(
        config: Config,
        index: Arc<VectorIndex>,
        backend: Arc<dyn CompletionBackend>,
    ) -> Self {
        let sessions = Arc::new(SessionStore::new(config.session_policy()));
        let options = ChatOptions {
            top_k: config.retrieval.top_k,
            system_template: config
                .chat
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_TEMPLATE.to_string()),
        };
        let orchestrator = Orchestrator::new(
            Arc::clone(&index),
            Arc::clone(&sessions),
            backend,
            options,
        );
        Self {
            config: Arc::new(config),
            index,
            sessions,
            registry: Arc::new(NormalizerRegistry::with_builtins()),
            orchestrator,
            save_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn registry(&self) -> &Arc<NormalizerRegistry> {
        &self.registry
    }

    pub async fn ingest_bytes(&self, bytes: Vec<u8>, name: &str) -> RagResult<IngestOutcome> {
        ingest::ingest_bytes(&self.index, &self.registry, bytes, name).await
    }

    /// Ingest a file, or every matching file under a directory.
    pub async fn ingest_path(&self, path: &Path) -> Result<IngestReport> {
        if path.is_dir() {
            return ingest::ingest_dir(&self.index, &self.registry, path, &self.config.ingest)
                .await;
        }
        let outcome = ingest::ingest_path(&self.index, &self.registry, path, None).await?;
        Ok(IngestReport {
            ingested: vec![outcome],
            ..Default::default()
        })
    }

    /// Drop every document recorded under `source`. Returns the number of
    /// chunks removed, or `None` when no document has that source.
    pub fn remove_source(&self, source: &str) -> Option<usize> {
        if !self.index.documents().iter().any(|d| d.source == source) {
            return None;
        }
        let chunks = self.index.remove_source(source);
        info!(source, chunks, "document removed");
        Some(chunks)
    }

    /// Search with `k`, or the configured `top_k` when `None`.
    pub async fn search(&self, query: &str, k: Option<usize>) -> RagResult<Vec<SearchHit>> {
        self.index
            .search(query, k.unwrap_or(self.config.retrieval.top_k))
            .await
    }

    pub fn converse(&self, session_id: &str, query: &str) -> RagResult<TurnStream> {
        self.orchestrator.converse(session_id, query)
    }

    pub fn history(&self, session_id: &str) -> Vec<Message> {
        self.orchestrator.history(session_id)
    }

    pub fn clear_session(&self, session_id: &str) {
        self.orchestrator.clear_session(session_id)
    }

    /// Persist the index to `[index] path`. Returns `None` when no path is
    /// configured. Concurrent saves are serialized.
    pub async fn save_index(&self) -> Result<Option<SaveReport>> {
        let Some(path) = &self.config.index.path else {
            return Ok(None);
        };
        let _guard = self.save_lock.lock().await;
        persist::save_index(&self.index, path).await.map(Some)
    }

    /// Periodically drop sessions idle past the TTL.
    pub fn spawn_session_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = sessions.evict_expired();
                if evicted > 0 {
                    debug!(evicted, "session sweep");
                }
            }
        })
    }

    /// Drop all sessions. The index is left as-is; call
    /// [`save_index`](Self::save_index) first to keep it.
    pub fn shutdown(&self) {
        self.sessions.shutdown();
        info!("oraculum shut down");
    }
}
