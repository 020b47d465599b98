//! End-to-end pipeline tests through the library API: ingest, search,
//! chat turns, and index persistence.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;

use oraculum::app::Oraculum;
use oraculum::chat::TurnState;
use oraculum::completion::{CompletionBackend, FragmentStream};
use oraculum::config::{parse_config, Config};
use oraculum::persist::{load_index, save_index};
use oraculum_core::embedding::{Embedder, HashEmbedder};
use oraculum_core::index::{IndexOptions, VectorIndex};
use oraculum_core::models::{Document, Role};
use oraculum_core::prompt::{ChatMessage, APOLOGY};
use oraculum_core::RagError;

const PRACA: &str = "A Praça dos Três Poderes é o espaço cívico de Brasília onde se encontram as sedes dos três poderes da República.\n\nNela ficam o Palácio do Planalto, o Congresso Nacional e o Supremo Tribunal Federal, projetados por Oscar Niemeyer.";

const CATEDRAL: &str = "A Catedral Metropolitana tem dezesseis colunas de concreto e vitrais azuis.\n\nA visitação é gratuita e a missa acontece aos domingos.";

/// Echoes the user's query back, one word per fragment.
struct Echo;

#[async_trait]
impl CompletionBackend for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    async fn stream(&self, messages: Vec<ChatMessage>) -> Result<FragmentStream> {
        let query = messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            for word in query.split_inclusive(' ') {
                tokio::task::yield_now().await;
                if tx.send(Ok(word.to_string())).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

/// Streams one fragment, then fails.
struct Broken;

#[async_trait]
impl CompletionBackend for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    async fn stream(&self, _messages: Vec<ChatMessage>) -> Result<FragmentStream> {
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            let _ = tx.send(Ok("A Praça ".to_string())).await;
            let _ = tx.send(Err(anyhow!("stream reset by peer"))).await;
        });
        Ok(rx)
    }
}

/// Hash embeddings, but fails on the n-th call.
struct FailingOnCall {
    inner: HashEmbedder,
    fail_on: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl Embedder for FailingOnCall {
    fn model_name(&self) -> &str {
        "hash"
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call == self.fail_on {
            return Err(anyhow!("embedding service unavailable"));
        }
        self.inner.embed(texts).await
    }
}

fn test_config(tmp: &TempDir) -> Config {
    let path = tmp.path().join("data").join("index.sqlite");
    parse_config(&format!(
        "[index]\npath = \"{}\"\n\n[embedding]\nprovider = \"hash\"\ndims = 256\n",
        path.display()
    ))
    .unwrap()
}

fn app_with(tmp: &TempDir, backend: Arc<dyn CompletionBackend>) -> Oraculum {
    let config = test_config(tmp);
    let index = VectorIndex::new(Arc::new(HashEmbedder::new(256)), config.index_options());
    Oraculum::from_parts(config, Arc::new(index), backend)
}

async fn drain(app: &Oraculum, session: &str, query: &str) -> (Vec<String>, Vec<RagError>) {
    let mut turn = app.converse(session, query).unwrap();
    let mut fragments = Vec::new();
    let mut errors = Vec::new();
    while let Some(item) = turn.next().await {
        match item {
            Ok(f) => fragments.push(f),
            Err(e) => errors.push(e),
        }
    }
    turn.finish().await;
    (fragments, errors)
}

#[tokio::test]
async fn test_praca_scenario_top_hit_is_ingested_file() {
    let tmp = TempDir::new().unwrap();
    let app = app_with(&tmp, Arc::new(Echo));

    app.ingest_bytes(CATEDRAL.as_bytes().to_vec(), "catedral.txt")
        .await
        .unwrap();
    let outcome = app
        .ingest_bytes(PRACA.as_bytes().to_vec(), "praca-dos-tres-poderes.md")
        .await
        .unwrap();
    assert_eq!(outcome.source, "praca-dos-tres-poderes.md");
    assert_eq!(outcome.content_type, "text/markdown");

    let hits = app
        .search("o que é a Praça dos Três Poderes", Some(1))
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].source, "praca-dos-tres-poderes.md");
}

#[tokio::test]
async fn test_substring_query_finds_its_document() {
    let tmp = TempDir::new().unwrap();
    let app = app_with(&tmp, Arc::new(Echo));
    app.ingest_bytes(PRACA.as_bytes().to_vec(), "praca.md")
        .await
        .unwrap();
    app.ingest_bytes(CATEDRAL.as_bytes().to_vec(), "catedral.txt")
        .await
        .unwrap();

    let hits = app
        .search("dezesseis colunas de concreto", Some(1))
        .await
        .unwrap();
    assert_eq!(hits[0].source, "catedral.txt");
}

#[tokio::test]
async fn test_empty_index_search_is_invalid_query() {
    let tmp = TempDir::new().unwrap();
    let app = app_with(&tmp, Arc::new(Echo));

    let err = app.search("Brasília", Some(10)).await.unwrap_err();
    assert!(matches!(err, RagError::InvalidQuery(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_turn_on_empty_index_is_degraded_not_failed() {
    let tmp = TempDir::new().unwrap();
    let app = app_with(&tmp, Arc::new(Echo));

    let mut turn = app.converse("s", "Brasília").unwrap();
    while turn.next().await.is_some() {}
    let report = turn.finish().await;

    assert_eq!(report.state, TurnState::Complete);
    assert!(report.degraded);
    assert!(report.sources.is_empty());
    assert_eq!(app.history("s").len(), 2);
}

#[tokio::test]
async fn test_save_load_reproduces_search_exactly() {
    let tmp = TempDir::new().unwrap();
    let app = app_with(&tmp, Arc::new(Echo));
    app.ingest_bytes(PRACA.as_bytes().to_vec(), "praca.md")
        .await
        .unwrap();
    app.ingest_bytes(CATEDRAL.as_bytes().to_vec(), "catedral.txt")
        .await
        .unwrap();

    let report = app.save_index().await.unwrap().unwrap();
    assert_eq!(report.documents, 2);

    let path = app.config().index.path.clone().unwrap();
    let loaded = load_index(
        &path,
        Arc::new(HashEmbedder::new(256)),
        app.config().index_options(),
    )
    .await
    .unwrap();

    for query in ["Niemeyer", "missa aos domingos", "Congresso Nacional"] {
        let before = app.search(query, Some(5)).await.unwrap();
        let after = loaded.search(query, 5).await.unwrap();
        assert_eq!(before.len(), after.len());
        for (b, a) in before.iter().zip(after.iter()) {
            assert_eq!(b.chunk.id, a.chunk.id);
            assert_eq!(b.chunk.text, a.chunk.text);
            assert_eq!(b.source, a.source);
            assert_eq!(b.score.to_bits(), a.score.to_bits());
        }
    }
}

#[tokio::test]
async fn test_reopen_loads_saved_index() {
    let tmp = TempDir::new().unwrap();
    {
        let app = app_with(&tmp, Arc::new(Echo));
        app.ingest_bytes(PRACA.as_bytes().to_vec(), "praca.md")
            .await
            .unwrap();
        app.save_index().await.unwrap();
    }

    let reopened = Oraculum::open(test_config(&tmp)).await.unwrap();
    assert_eq!(reopened.index().documents().len(), 1);
    let hits = reopened.search("Supremo Tribunal", None).await.unwrap();
    assert_eq!(hits[0].source, "praca.md");
}

#[tokio::test]
async fn test_failed_embedding_leaves_no_partial_document() {
    let embedder = Arc::new(FailingOnCall {
        inner: HashEmbedder::new(64),
        fail_on: 1,
        calls: AtomicUsize::new(0),
    });
    let index = VectorIndex::new(
        embedder,
        IndexOptions {
            max_tokens: 16,
            overlap_tokens: 0,
            batch_size: 1,
        },
    );

    let text = (0..40)
        .map(|i| format!("Parágrafo {} sobre o Eixo Monumental de Brasília.", i))
        .collect::<Vec<_>>()
        .join("\n\n");
    let err = index
        .add(&Document::new("eixo.md", "text/markdown", text))
        .await
        .unwrap_err();

    assert!(matches!(err, RagError::Embedding(_)));
    assert!(index.is_empty());
    assert!(index.documents().is_empty());
}

#[tokio::test]
async fn test_save_then_load_with_other_dims_is_corruption() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("index.sqlite");
    let index = VectorIndex::new(Arc::new(HashEmbedder::new(32)), IndexOptions::default());
    index
        .add(&Document::new("a.txt", "text/plain", CATEDRAL.to_string()))
        .await
        .unwrap();
    save_index(&index, &path).await.unwrap();

    let err = load_index(
        &path,
        Arc::new(HashEmbedder::new(64)),
        IndexOptions::default(),
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, RagError::IndexCorruption(_)));
}

#[tokio::test]
async fn test_concurrent_sessions_do_not_cross_append() {
    let tmp = TempDir::new().unwrap();
    let app = Arc::new(app_with(&tmp, Arc::new(Echo)));
    app.ingest_bytes(PRACA.as_bytes().to_vec(), "praca.md")
        .await
        .unwrap();

    let mut handles = Vec::new();
    for (session, query) in [("a", "pergunta alfa"), ("b", "pergunta beta")] {
        let app = Arc::clone(&app);
        handles.push(tokio::spawn(async move {
            for _ in 0..5 {
                let (fragments, errors) = drain(&app, session, query).await;
                assert!(errors.is_empty());
                assert_eq!(fragments.concat(), query);
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    for (session, query) in [("a", "pergunta alfa"), ("b", "pergunta beta")] {
        let history = app.history(session);
        assert_eq!(history.len(), 10);
        for pair in history.chunks(2) {
            assert_eq!(pair[0].role, Role::Human);
            assert_eq!(pair[0].content, query);
            assert_eq!(pair[1].role, Role::Assistant);
            assert_eq!(pair[1].content, query);
        }
        for w in history.windows(2) {
            assert!(w[0].timestamp <= w[1].timestamp);
        }
    }
}

#[tokio::test]
async fn test_completion_failure_records_apology_and_next_turn_works() {
    let tmp = TempDir::new().unwrap();
    let broken = app_with(&tmp, Arc::new(Broken));
    broken
        .ingest_bytes(PRACA.as_bytes().to_vec(), "praca.md")
        .await
        .unwrap();

    let (fragments, errors) = drain(&broken, "s", "o que é a Praça?").await;
    assert_eq!(fragments, vec!["A Praça "]);
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], RagError::CompletionEndpoint(_)));

    let history = broken.history("s");
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].content, APOLOGY);

    // The session and index are still usable.
    assert_eq!(broken.index().documents().len(), 1);
    let mut turn = broken.converse("s", "e agora?").unwrap();
    while turn.next().await.is_some() {}
    assert_eq!(turn.finish().await.state, TurnState::Error);
    assert_eq!(broken.history("s").len(), 4);
}

#[tokio::test]
async fn test_clear_session_resets_history() {
    let tmp = TempDir::new().unwrap();
    let app = app_with(&tmp, Arc::new(Echo));

    drain(&app, "s", "olá").await;
    assert_eq!(app.history("s").len(), 2);
    app.clear_session("s");
    assert!(app.history("s").is_empty());

    drain(&app, "s", "de novo").await;
    assert_eq!(app.history("s").len(), 2);
}

#[tokio::test]
async fn test_ingest_directory_reports_failures_and_skips() {
    let tmp = TempDir::new().unwrap();
    let docs = tmp.path().join("docs");
    std::fs::create_dir_all(docs.join("monumentos")).unwrap();
    std::fs::write(docs.join("praca.md"), PRACA).unwrap();
    std::fs::write(docs.join("monumentos").join("catedral.txt"), CATEDRAL).unwrap();
    std::fs::write(docs.join("vazio.txt"), "   \n").unwrap();
    std::fs::write(docs.join("foto.png"), [0x89, b'P', b'N', b'G']).unwrap();

    let app = app_with(&tmp, Arc::new(Echo));
    let report = app.ingest_path(&docs).await.unwrap();

    let sources: Vec<&str> = report.ingested.iter().map(|o| o.source.as_str()).collect();
    assert_eq!(sources, vec!["monumentos/catedral.txt", "praca.md"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(app.index().documents().len(), 2);
}
