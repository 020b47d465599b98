//! The RAG orchestrator: one chat turn as a small state machine.
//!
//! ```text
//!  Idle ──► Retrieving ──► Synthesizing ──► Streaming ──► Complete
//!               │                              │
//!               └─► (degraded, continues)      └─► Error
//! ```
//!
//! - **Idle → Retrieving**: the human message is appended to the session,
//!   then the index is searched for `top_k` chunks.
//! - **Retrieving**: a failed search (empty index, embedder down) does not
//!   fail the turn; the prompt gets
//!   [`NO_CONTEXT`](oraculum_core::prompt::NO_CONTEXT) and the report is marked
//!   `degraded`.
//! - **Synthesizing**: system prompt with the formatted context, prior
//!   history, and the query are assembled into the request.
//! - **Streaming**: fragments are forwarded to the [`TurnStream`] as they
//!   arrive. On success the full answer is appended as the assistant
//!   message. If the endpoint fails, at start or mid-stream, [`APOLOGY`] is
//!   appended instead and the error is yielded to the caller.
//!
//! Each turn runs on its own task. Dropping the [`TurnStream`] cancels the
//! turn: the task stops, drops the upstream completion stream, and appends
//! no assistant message.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use oraculum_core::history::{SessionStore, TurnGuard};
use oraculum_core::index::VectorIndex;
use oraculum_core::models::{Message, SearchHit};
use oraculum_core::prompt::{build_messages, format_context, APOLOGY, DEFAULT_SYSTEM_TEMPLATE};
use oraculum_core::{RagError, RagResult};

use crate::completion::{CompletionBackend, FragmentStream};

/// Capacity of the channel between a turn task and its [`TurnStream`].
const TURN_BUFFER: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnState {
    Idle,
    Retrieving,
    Synthesizing,
    Streaming,
    Complete,
    Error,
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TurnState::Idle => "idle",
            TurnState::Retrieving => "retrieving",
            TurnState::Synthesizing => "synthesizing",
            TurnState::Streaming => "streaming",
            TurnState::Complete => "complete",
            TurnState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Summary of a finished turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnReport {
    pub session_id: String,
    /// `Complete` or `Error`.
    pub state: TurnState,
    /// The assistant message recorded in history: the full answer, or the
    /// apology if synthesis failed.
    pub answer: String,
    /// Distinct sources of the retrieved chunks, best first.
    pub sources: Vec<String>,
    /// Retrieval failed and the answer was generated without context.
    pub degraded: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub top_k: usize,
    /// System prompt; `{context}` is replaced by the retrieved passages.
    pub system_template: String,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            top_k: 10,
            system_template: DEFAULT_SYSTEM_TEMPLATE.to_string(),
        }
    }
}

enum TurnItem {
    Fragment(String),
    Failed(RagError),
    Finished(TurnReport),
}

/// Fragments of one turn's answer, in arrival order.
///
/// Dropping the stream cancels the turn.
pub struct TurnStream {
    session_id: String,
    rx: mpsc::Receiver<TurnItem>,
    report: Option<TurnReport>,
}

impl TurnStream {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Next fragment. Yields `Some(Err(_))` at most once, when synthesis
    /// fails; returns `None` once the turn is over.
    pub async fn next(&mut self) -> Option<RagResult<String>> {
        loop {
            match self.rx.recv().await? {
                TurnItem::Fragment(text) => return Some(Ok(text)),
                TurnItem::Failed(e) => return Some(Err(e)),
                TurnItem::Finished(report) => {
                    self.report = Some(report);
                }
            }
        }
    }

    /// Drain the remaining fragments and return the turn's report.
    pub async fn finish(mut self) -> TurnReport {
        while self.next().await.is_some() {}
        self.report.take().unwrap_or_else(|| TurnReport {
            session_id: self.session_id.clone(),
            state: TurnState::Error,
            answer: String::new(),
            sources: Vec::new(),
            degraded: false,
            error: Some("turn ended without a report".to_string()),
        })
    }
}

/// Runs chat turns against an index, a session store and a completion backend.
pub struct Orchestrator {
    index: Arc<VectorIndex>,
    sessions: Arc<SessionStore>,
    backend: Arc<dyn CompletionBackend>,
    options: ChatOptions,
}

impl Orchestrator {
    pub fn new(
        index: Arc<VectorIndex>,
        sessions: Arc<SessionStore>,
        backend: Arc<dyn CompletionBackend>,
        options: ChatOptions,
    ) -> Self {
        Self {
            index,
            sessions,
            backend,
            options,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Start a turn. Must be called from within a Tokio runtime.
    ///
    /// The human message is in the session's history by the time this
    /// returns.
    ///
    /// # Errors
    ///
    /// - [`RagError::InvalidQuery`] if `query` is blank.
    /// - [`RagError::TurnInProgress`] if the session already has a turn running.
    pub fn converse(&self, session_id: &str, query: &str) -> RagResult<TurnStream> {
        let query = query.trim();
        if query.is_empty() {
            return Err(RagError::InvalidQuery("query must not be empty".to_string()));
        }

        let session = self.sessions.get_or_create(session_id);
        let guard = session
            .begin_turn()
            .ok_or_else(|| RagError::TurnInProgress(session_id.to_string()))?;

        let history = session.messages();
        session.append(Message::human(query));
        debug!(session = %session_id, from = %TurnState::Idle, to = %TurnState::Retrieving, "turn state");

        let (tx, rx) = mpsc::channel(TURN_BUFFER);
        let turn = Turn {
            guard,
            index: Arc::clone(&self.index),
            backend: Arc::clone(&self.backend),
            options: self.options.clone(),
            history,
            query: query.to_string(),
            state: TurnState::Retrieving,
            tx,
        };
        tokio::spawn(turn.run());

        Ok(TurnStream {
            session_id: session_id.to_string(),
            rx,
            report: None,
        })
    }

    /// Messages of a session, oldest first.
    pub fn history(&self, session_id: &str) -> Vec<Message> {
        self.sessions.list(session_id)
    }

    /// Forget a session's messages. The session id stays usable.
    pub fn clear_session(&self, session_id: &str) {
        self.sessions.clear(session_id);
        info!(session = %session_id, "session cleared");
    }
}

/// State owned by one running turn. Holding `guard` keeps the session's
/// turn gate closed and the session resident.
struct Turn {
    guard: TurnGuard,
    index: Arc<VectorIndex>,
    backend: Arc<dyn CompletionBackend>,
    options: ChatOptions,
    history: Vec<Message>,
    query: String,
    state: TurnState,
    tx: mpsc::Sender<TurnItem>,
}

enum StreamEnd {
    Complete(String),
    Failed(String),
    Cancelled,
}

impl Turn {
    fn session_id(&self) -> &str {
        self.guard.session().id()
    }

    fn transition(&mut self, to: TurnState) {
        debug!(session = %self.session_id(), from = %self.state, to = %to, "turn state");
        self.state = to;
    }

    async fn run(mut self) {
        // Retrieving
        let searched = tokio::select! {
            _ = self.tx.closed() => return self.cancelled(),
            searched = self.index.search(&self.query, self.options.top_k) => searched,
        };
        let (hits, degraded) = match searched {
            Ok(hits) => (hits, false),
            Err(e) => {
                warn!(session = %self.session_id(), error = %e, "retrieval failed, continuing without context");
                (Vec::new(), true)
            }
        };
        let sources = distinct_sources(&hits);

        // Synthesizing
        self.transition(TurnState::Synthesizing);
        let context = format_context(&hits);
        let messages = build_messages(
            &self.options.system_template,
            &context,
            &self.history,
            &self.query,
        );

        // Streaming
        self.transition(TurnState::Streaming);
        let started = tokio::select! {
            _ = self.tx.closed() => return self.cancelled(),
            started = self.backend.stream(messages) => started,
        };
        let end = match started {
            Ok(upstream) => self.forward(upstream).await,
            Err(e) => StreamEnd::Failed(format!("{:#}", e)),
        };

        let session = Arc::clone(self.guard.session());
        let (answer, error) = match end {
            StreamEnd::Cancelled => return self.cancelled(),
            StreamEnd::Complete(answer) => {
                self.transition(TurnState::Complete);
                session.append(Message::assistant(answer.clone()));
                (answer, None)
            }
            StreamEnd::Failed(message) => {
                self.transition(TurnState::Error);
                warn!(session = %self.session_id(), error = %message, "completion failed");
                session.append(Message::assistant(APOLOGY));
                let _ = self
                    .tx
                    .send(TurnItem::Failed(RagError::CompletionEndpoint(message.clone())))
                    .await;
                (APOLOGY.to_string(), Some(message))
            }
        };

        info!(
            session = %self.session_id(),
            state = %self.state,
            chunks = hits.len(),
            degraded,
            "turn finished"
        );
        let report = TurnReport {
            session_id: self.session_id().to_string(),
            state: self.state,
            answer,
            sources,
            degraded,
            error,
        };
        let _ = self.tx.send(TurnItem::Finished(report)).await;
    }

    fn cancelled(&self) {
        info!(session = %self.session_id(), state = %self.state, "turn cancelled by consumer");
    }

    async fn forward(&self, mut upstream: FragmentStream) -> StreamEnd {
        let mut answer = String::new();
        loop {
            let item = tokio::select! {
                _ = self.tx.closed() => return StreamEnd::Cancelled,
                item = upstream.recv() => item,
            };
            match item {
                Some(Ok(fragment)) => {
                    answer.push_str(&fragment);
                    if self.tx.send(TurnItem::Fragment(fragment)).await.is_err() {
                        return StreamEnd::Cancelled;
                    }
                }
                Some(Err(e)) => return StreamEnd::Failed(format!("{:#}", e)),
                None => return StreamEnd::Complete(answer),
            }
        }
    }
}

fn distinct_sources(hits: &[SearchHit]) -> Vec<String> {
    let mut sources: Vec<String> = Vec::new();
    for hit in hits {
        if !sources.contains(&hit.source) {
            sources.push(hit.source.clone());
        }
    }
    sources
}
