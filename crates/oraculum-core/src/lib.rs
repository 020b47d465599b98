//! # Oraculum Core
//!
//! Runtime-agnostic logic for Oraculum: data models, the error taxonomy,
//! chunking, the embedder trait, the vector index, session history, and
//! prompt assembly.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem code. The
//! `oraculum` app crate supplies embedding and completion backends,
//! persistence, and the CLI/HTTP surfaces.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod history;
pub mod index;
pub mod models;
pub mod prompt;

pub use error::{RagError, RagResult};
