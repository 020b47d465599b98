//! # Oraculum
//!
//! A retrieval-augmented chat assistant. Documents are normalized to text,
//! chunked, embedded and kept in a vector index; each chat turn retrieves
//! the closest chunks, injects them into the system prompt together with
//! the session's history, and streams the model's answer back.
//!
//! ## Architecture
//!
//! ```text
//! file ──► normalize ──► chunk ──► embed ──► VectorIndex ──► save/load (SQLite)
//!                                                 │
//! query ──► Orchestrator ──► search(k) ──► prompt ──► CompletionBackend ──► fragments
//!                 │                                                            │
//!                 └──────────────── SessionStore ◄────── append ◄──────────────┘
//! ```
//!
//! Runtime-agnostic pieces (models, chunker, index, session store, prompt
//! assembly) live in `oraculum-core`; this crate adds I/O.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`normalize`] | Extension-keyed normalizers (text, HTML, PDF, DOCX, PPTX, XLSX) |
//! | [`embedding`] | Embedding providers (hash, OpenAI, disabled) |
//! | [`completion`] | Streaming chat-completion backends |
//! | [`db`] | SQLite connection management |
//! | [`migrate`] | Index file schema |
//! | [`persist`] | Index save/load |
//! | [`ingest`] | Bytes, file and directory ingestion |
//! | [`chat`] | Per-turn RAG state machine |
//! | [`app`] | Application handle wiring everything together |
//! | [`server`] | HTTP server with SSE streaming |

pub mod app;
pub mod chat;
pub mod completion;
pub mod config;
pub mod db;
pub mod embedding;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod normalize;
pub mod persist;
pub mod server;
