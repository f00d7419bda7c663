//! # Credence CLI (`cred`)
//!
//! ## Usage
//!
//! ```bash
//! cred --config ./config/credence.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cred init` | Create the SQLite database and run schema migrations |
//! | `cred ingest` | Pull new documents from the feed, chunk and embed them |
//! | `cred embed pending` | Embed stored documents that have no embedding |
//! | `cred search "<query>"` | Semantic search with metadata filters |
//! | `cred trust <id> --increase\|--decrease` | Adjust trust and diffuse to neighbors |
//! | `cred stats` | Document, embedding and checkpoint summary |
//!
//! Logs go to stderr and honour `RUST_LOG` (default `info`).

use clap::{ArgGroup, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use credence::search::SearchOptions;
use credence::{config, embed_cmd, ingest, migrate, search, stats, trust_cmd};
use credence_core::models::TrustDirection;

/// Credence: trust-scored semantic document retrieval.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(name = "cred", version, about = "Credence — trust-scored semantic document retrieval")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/credence.toml")]
    config: PathBuf,

    /// Print machine-readable JSON instead of a text report.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it multiple times is safe.
    Init,

    /// Ingest new documents from the feed.
    ///
    /// Resumes from the last checkpoint; retries retryable failures with
    /// exponential backoff up to `ingest.max_retries`.
    Ingest {
        /// Ignore the checkpoint and start from the first page.
        #[arg(long)]
        full: bool,

        /// Stop after this many new documents.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Manage embedding vectors.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Semantic search over ingested documents.
    Search {
        query: String,

        /// Maximum number of results (default `retrieval.limit`).
        #[arg(long)]
        limit: Option<usize>,

        /// Minimum cosine similarity (default `retrieval.threshold`).
        #[arg(long)]
        threshold: Option<f64>,

        /// Only documents of this article type.
        #[arg(long = "type")]
        kind: Option<String>,

        /// Match any of these classifications (repeatable).
        #[arg(long = "classification")]
        classifications: Vec<String>,

        /// Match any of these publication ids (repeatable).
        #[arg(long = "publication")]
        publication_ids: Vec<i64>,

        /// Published on or after (YYYY-MM-DD or timestamp).
        #[arg(long)]
        start: Option<String>,

        /// Published on or before (YYYY-MM-DD covers the whole day).
        #[arg(long)]
        end: Option<String>,
    },

    /// Mark a document trusted or untrusted.
    #[command(group(ArgGroup::new("direction").required(true).args(["increase", "decrease"])))]
    Trust {
        /// Document id (the feed's natural key).
        id: String,

        #[arg(long)]
        increase: bool,

        #[arg(long)]
        decrease: bool,
    },

    /// Show document, embedding and checkpoint counts.
    Stats,
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed documents that have no embedding yet.
    Pending {
        /// Maximum number of documents to embed in this run.
        #[arg(long)]
        limit: Option<usize>,

        /// Show counts without embedding anything.
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { full, limit } => {
            ingest::run_ingest(&cfg, full, limit, cli.json).await?;
        }
        Commands::Embed { action } => match action {
            EmbedAction::Pending { limit, dry_run } => {
                embed_cmd::run_embed_pending(&cfg, limit, dry_run).await?;
            }
        },
        Commands::Search {
            query,
            limit,
            threshold,
            kind,
            classifications,
            publication_ids,
            start,
            end,
        } => {
            let opts = SearchOptions {
                limit,
                threshold,
                kind,
                classifications,
                publication_ids,
                start,
                end,
            };
            search::run_search(&cfg, &query, &opts, cli.json).await?;
        }
        Commands::Trust { id, increase, .. } => {
            let direction = if increase {
                TrustDirection::Increase
            } else {
                TrustDirection::Decrease
            };
            trust_cmd::run_trust(&cfg, &id, direction, cli.json).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg, cli.json).await?;
        }
    }

    Ok(())
}
