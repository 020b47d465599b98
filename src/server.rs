//! HTTP server.
//!
//! Exposes ingestion, search and streaming chat over a JSON/SSE API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (version, index size) |
//! | `GET`  | `/documents` | Indexed document metadata |
//! | `POST` | `/documents?name=<file>` | Ingest the raw request body as `<file>` |
//! | `DELETE` | `/documents/{source}` | Remove a document by source (may contain `/`) |
//! | `GET`  | `/search?q=<text>&k=<n>` | k-NN search |
//! | `POST` | `/sessions/{id}/turns` | Chat turn, streamed as SSE |
//! | `GET`  | `/sessions/{id}/messages` | Session history |
//! | `DELETE` | `/sessions/{id}/messages` | Clear session history |
//! | `POST` | `/index/save` | Persist the index |
//!
//! # Streaming
//!
//! `POST /sessions/{id}/turns` with `{"query": "..."}` answers with an
//! event stream: one `fragment` event per piece of the answer (data: the
//! piece as a JSON string), then either `done` (data: the turn report) or
//! `error` (data: an error body). A client that disconnects cancels the turn.
//!
//! Uploads and removals are saved to `[index] path` as they happen, and
//! once more on shutdown.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "invalid_query", "message": "the index is empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `invalid_query` (400), `not_found` (404),
//! `unsupported_format` (415), `conversion_failed` (422),
//! `turn_in_progress` (409), `embedding_failed` and `completion_failed` (502),
//! `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! clients.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        rejection::{JsonRejection, QueryRejection},
        DefaultBodyLimit, Path, Query, State,
    },
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use oraculum_core::models::{DocumentMeta, Message};
use oraculum_core::RagError;

use crate::app::Oraculum;
use crate::chat::TurnStream;
use crate::ingest::IngestOutcome;

/// Interval between idle-session sweeps while serving.
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Build the router. Exposed separately from [`run_server`] for tests and
/// for embedding in a larger axum application.
pub fn build_router(app: Arc<Oraculum>) -> Router {
    let body_limit = usize::try_from(app.config().ingest.max_file_bytes).unwrap_or(usize::MAX);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/documents", get(handle_list_documents).post(handle_upload))
        .route("/documents/{*source}", delete(handle_remove))
        .route("/search", get(handle_search))
        .route("/sessions/{id}/turns", post(handle_turn))
        .route(
            "/sessions/{id}/messages",
            get(handle_history).delete(handle_clear),
        )
        .route("/index/save", post(handle_save))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(app)
}

/// Serve until Ctrl-C, then drop all sessions.
pub async fn run_server(app: Arc<Oraculum>) -> anyhow::Result<()> {
    let bind_addr = app.config().server.bind.clone();
    let sweeper = app.spawn_session_sweeper(SESSION_SWEEP_INTERVAL);
    let router = build_router(Arc::clone(&app));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "HTTP server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    sweeper.abort();
    persist_quietly(&app).await;
    app.shutdown();
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"bad_request"`, `"invalid_query"`).
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl AppError {
    fn body(&self) -> ErrorBody {
        ErrorBody {
            error: ErrorDetail {
                code: self.code.clone(),
                message: self.message.clone(),
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body())).into_response()
    }
}

impl From<RagError> for AppError {
    fn from(e: RagError) -> Self {
        let status = match &e {
            RagError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
            RagError::UnsupportedFormat(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            RagError::Conversion(_) => StatusCode::UNPROCESSABLE_ENTITY,
            RagError::TurnInProgress(_) => StatusCode::CONFLICT,
            RagError::Embedding(_) | RagError::CompletionEndpoint(_) => StatusCode::BAD_GATEWAY,
            RagError::IndexCorruption(_) | RagError::SessionNotFound(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let code = match status {
            StatusCode::INTERNAL_SERVER_ERROR => "internal",
            _ => e.code(),
        };
        AppError {
            status,
            code: code.to_string(),
            message: e.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    documents: usize,
    chunks: usize,
}

async fn handle_health(State(app): State<Arc<Oraculum>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        documents: app.index().documents().len(),
        chunks: app.index().len(),
    })
}

// ============ /documents ============

#[derive(Serialize)]
struct DocumentListResponse {
    documents: Vec<DocumentMeta>,
}

async fn handle_list_documents(State(app): State<Arc<Oraculum>>) -> Json<DocumentListResponse> {
    Json(DocumentListResponse {
        documents: app.index().documents(),
    })
}

#[derive(Deserialize)]
struct UploadParams {
    name: Option<String>,
}

async fn handle_upload(
    State(app): State<Arc<Oraculum>>,
    params: Result<Query<UploadParams>, QueryRejection>,
    body: Bytes,
) -> Result<(StatusCode, Json<IngestOutcome>), AppError> {
    let Query(params) = params.map_err(|e| bad_request(e.body_text()))?;
    let name = params
        .name
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| bad_request("query parameter `name` is required"))?;
    if body.is_empty() {
        return Err(bad_request("request body is empty"));
    }
    let outcome = app.ingest_bytes(body.to_vec(), &name).await?;
    persist_quietly(&app).await;
    Ok((StatusCode::CREATED, Json(outcome)))
}

#[derive(Serialize)]
struct RemoveResponse {
    source: String,
    chunks_removed: usize,
}

async fn handle_remove(
    State(app): State<Arc<Oraculum>>,
    Path(source): Path<String>,
) -> Result<Json<RemoveResponse>, AppError> {
    let chunks_removed = app
        .remove_source(&source)
        .ok_or_else(|| not_found(format!("no document with source {}", source)))?;
    persist_quietly(&app).await;
    Ok(Json(RemoveResponse {
        source,
        chunks_removed,
    }))
}

/// Save the index after a change. The in-memory index stays authoritative,
/// so a failed save is logged rather than failing the request.
async fn persist_quietly(app: &Oraculum) {
    if let Err(e) = app.save_index().await {
        warn!(error = %format!("{:#}", e), "index save failed");
    }
}

// ============ GET /search ============

#[derive(Deserialize)]
struct SearchParams {
    q: Option<String>,
    k: Option<usize>,
}

#[derive(Serialize)]
struct SearchHitResponse {
    source: String,
    document_id: String,
    chunk_index: i64,
    score: f32,
    text: String,
}

#[derive(Serialize)]
struct SearchResponse {
    hits: Vec<SearchHitResponse>,
}

async fn handle_search(
    State(app): State<Arc<Oraculum>>,
    params: Result<Query<SearchParams>, QueryRejection>,
) -> Result<Json<SearchResponse>, AppError> {
    let Query(params) = params.map_err(|e| bad_request(e.body_text()))?;
    let query = params
        .q
        .ok_or_else(|| bad_request("query parameter `q` is required"))?;
    let hits = app.search(&query, params.k).await?;
    Ok(Json(SearchResponse {
        hits: hits
            .into_iter()
            .map(|h| SearchHitResponse {
                source: h.source,
                document_id: h.chunk.document_id,
                chunk_index: h.chunk.chunk_index,
                score: h.score,
                text: h.chunk.text,
            })
            .collect(),
    }))
}

// ============ POST /sessions/{id}/turns ============

#[derive(Deserialize)]
struct TurnRequest {
    query: String,
}

async fn handle_turn(
    State(app): State<Arc<Oraculum>>,
    Path(session_id): Path<String>,
    payload: Result<Json<TurnRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let Json(request) = payload.map_err(|e| bad_request(e.body_text()))?;
    let turn = app.converse(&session_id, &request.query)?;
    Ok(Sse::new(turn_events(turn)).keep_alive(KeepAlive::default()))
}

/// `fragment`* then `done` | `error`. Dropping the stream drops the turn.
fn turn_events(turn: TurnStream) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(Some(turn), |state| async move {
        let mut turn = state?;
        let event = match turn.next().await {
            Some(Ok(fragment)) => {
                // JSON keeps `\r` and other line breaks intact on the wire.
                let event = Event::default()
                    .event("fragment")
                    .json_data(&fragment)
                    .unwrap_or_else(|_| Event::default().event("fragment"));
                return Some((Ok(event), Some(turn)));
            }
            Some(Err(e)) => {
                let body = AppError::from(e).body();
                Event::default()
                    .event("error")
                    .json_data(&body)
                    .unwrap_or_else(|_| Event::default().event("error"))
            }
            None => {
                let report = turn.finish().await;
                Event::default()
                    .event("done")
                    .json_data(&report)
                    .unwrap_or_else(|_| Event::default().event("done"))
            }
        };
        Some((Ok(event), None))
    })
}

// ============ /sessions/{id}/messages ============

#[derive(Serialize)]
struct HistoryResponse {
    session_id: String,
    messages: Vec<Message>,
}

async fn handle_history(
    State(app): State<Arc<Oraculum>>,
    Path(session_id): Path<String>,
) -> Json<HistoryResponse> {
    let messages = app.history(&session_id);
    Json(HistoryResponse {
        session_id,
        messages,
    })
}

async fn handle_clear(
    State(app): State<Arc<Oraculum>>,
    Path(session_id): Path<String>,
) -> StatusCode {
    app.clear_session(&session_id);
    StatusCode::NO_CONTENT
}

// ============ POST /index/save ============

#[derive(Serialize)]
struct SaveResponse {
    saved: bool,
    documents: usize,
    chunks: usize,
}

async fn handle_save(State(app): State<Arc<Oraculum>>) -> Result<Json<SaveResponse>, AppError> {
    match app.save_index().await {
        Ok(Some(report)) => Ok(Json(SaveResponse {
            saved: true,
            documents: report.documents,
            chunks: report.chunks,
        })),
        Ok(None) => Err(bad_request("no [index] path configured")),
        Err(e) => {
            error!(error = %format!("{:#}", e), "index save failed");
            Err(internal(format!("{:#}", e)))
        }
    }
}
