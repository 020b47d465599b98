//! # Oraculum CLI (`orc`)
//!
//! ## Usage
//!
//! ```bash
//! orc --config ./config/oraculum.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `orc ingest <paths...>` | Normalize, embed and index files or directories, then save the index |
//! | `orc remove <source>` | Drop one document from the index, then save it |
//! | `orc search "<query>"` | Show the chunks a chat turn would retrieve |
//! | `orc chat` | Interactive chat on stdin; `/clear` resets the conversation |
//! | `orc serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! # Index a folder of guides
//! orc ingest ./docs --config ./config/oraculum.toml
//!
//! # Inspect retrieval
//! orc search "horário de visitação da Catedral" -k 5
//!
//! # Chat under a fixed session id (history lives only as long as the process)
//! OPENAI_API_KEY=... orc chat --session visita-1
//! ```

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

use oraculum::app::Oraculum;
use oraculum::config::{load_config, Config};
use oraculum::{logging, server};
use oraculum_core::prompt::APOLOGY;

/// Oraculum: retrieval-augmented chat over your documents.
#[derive(Parser)]
#[command(
    name = "orc",
    about = "Oraculum: retrieval-augmented chat over your documents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML). Built-in defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level (overridden by `RUST_LOG`).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest files or directories into the index.
    ///
    /// Directories are walked recursively, filtered by `[ingest]` globs.
    /// Files that fail are reported and skipped. The index is saved
    /// afterwards when `[index] path` is set.
    Ingest {
        /// Files or directories to ingest.
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Remove a document from the index by its source name.
    ///
    /// The source is the name `ingest` printed, e.g. `roteiros/catedral.txt`.
    Remove {
        /// Source name of the document to remove.
        source: String,
    },

    /// Search the index.
    Search {
        /// Search query text.
        query: String,

        /// Number of results (defaults to `[retrieval] top_k`).
        #[arg(short)]
        k: Option<usize>,
    },

    /// Chat interactively on stdin.
    Chat {
        /// Session id. A fresh UUID when omitted.
        #[arg(long)]
        session: Option<String>,
    },

    /// Start the HTTP server on `[server] bind`.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(if cli.verbose { "debug" } else { "info" });

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };
    let app = Arc::new(Oraculum::open(config).await?);

    match cli.command {
        Commands::Ingest { paths } => run_ingest(&app, &paths).await,
        Commands::Remove { source } => run_remove(&app, &source).await,
        Commands::Search { query, k } => run_search(&app, &query, k).await,
        Commands::Chat { session } => run_chat(&app, session).await,
        Commands::Serve => server::run_server(app).await,
    }
}

async fn run_ingest(app: &Oraculum, paths: &[PathBuf]) -> Result<()> {
    let mut ingested = 0usize;
    let mut chunks = 0usize;
    let mut failed = 0usize;
    let mut skipped = 0usize;

    for path in paths {
        match app.ingest_path(path).await {
            Ok(report) => {
                for outcome in &report.ingested {
                    println!("  + {} ({} chunks)", outcome.source, outcome.chunks);
                }
                for failure in &report.failed {
                    println!("  ! {}: {}", failure.path, failure.error);
                }
                ingested += report.ingested.len();
                chunks += report.chunks();
                failed += report.failed.len();
                skipped += report.skipped;
            }
            Err(e) => {
                println!("  ! {}: {:#}", path.display(), e);
                failed += 1;
            }
        }
    }

    println!(
        "Ingested {} documents ({} chunks), {} failed, {} skipped",
        ingested, chunks, failed, skipped
    );

    if let Some(report) = app.save_index().await? {
        println!(
            "Index saved: {} documents, {} chunks",
            report.documents, report.chunks
        );
    }
    Ok(())
}

async fn run_remove(app: &Oraculum, source: &str) -> Result<()> {
    let Some(chunks) = app.remove_source(source) else {
        bail!("no document with source '{}'", source);
    };
    println!("Removed {} ({} chunks)", source, chunks);

    if let Some(report) = app.save_index().await? {
        println!(
            "Index saved: {} documents, {} chunks",
            report.documents, report.chunks
        );
    }
    Ok(())
}

async fn run_search(app: &Oraculum, query: &str, k: Option<usize>) -> Result<()> {
    let hits = app.search(query, k).await?;
    for (i, hit) in hits.iter().enumerate() {
        println!(
            "{}. [{:.3}] {} #{}",
            i + 1,
            hit.score,
            hit.source,
            hit.chunk.chunk_index
        );
        let preview: String = hit.chunk.text.chars().take(240).collect();
        println!("   {}", preview.replace('\n', " "));
    }
    Ok(())
}

async fn run_chat(app: &Oraculum, session: Option<String>) -> Result<()> {
    let session_id = session.unwrap_or_else(|| Uuid::new_v4().to_string());
    eprintln!("Session {} (/clear to reset, /quit to leave)", session_id);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        eprint!("> ");
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/clear" => {
                app.clear_session(&session_id);
                eprintln!("(conversation cleared)");
                continue;
            }
            _ => {}
        }

        let mut turn = match app.converse(&session_id, line) {
            Ok(turn) => turn,
            Err(e) => {
                eprintln!("Error: {}", e);
                continue;
            }
        };

        let mut stdout = std::io::stdout();
        while let Some(fragment) = turn.next().await {
            match fragment {
                Ok(text) => {
                    print!("{}", text);
                    stdout.flush()?;
                }
                Err(e) => {
                    eprintln!("\nError: {}", e);
                    print!("{}", APOLOGY);
                }
            }
        }
        println!();

        let report = turn.finish().await;
        if !report.sources.is_empty() {
            eprintln!("  fontes: {}", report.sources.join(", "));
        }
        if report.degraded {
            eprintln!("  (sem contexto: a busca falhou)");
        }
    }

    app.shutdown();
    Ok(())
}
