//! # Context Loom CLI (`loom`)
//!
//! The `loom` binary indexes a document collection, assembles token-budgeted
//! requests from a conversation, and streams answers from a backend.
//!
//! ## Usage
//!
//! ```bash
//! loom --config ./config/loom.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `loom init` | Create the SQLite database and schema |
//! | `loom sources` | List configured source types and their directories |
//! | `loom sync` | Bring the index in line with the document collection |
//! | `loom search "<query>"` | Ranked keyword search |
//! | `loom assemble "<message>"` | Print the assembled request as JSON |
//! | `loom ask "<message>"` | Assemble and stream an answer from the backend |
//! | `loom facts add "<fact>"` | Append to the facts file |
//! | `loom facts list` | Print the facts file |
//! | `loom stats` | Index statistics |
//!
//! ## Examples
//!
//! ```bash
//! loom init
//! loom sync
//! loom search "lighthouse keeper" --source characters
//! loom ask "What happened to the keeper?" --history ./chat.json
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use context_loom::{ask, config, facts, index, ingest, progress, search, sources, stats};

/// Context Loom: token-budgeted context assembly over a local document
/// collection.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(
    name = "loom",
    about = "Context Loom: token-budgeted context assembly, retrieval, and streaming",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/loom.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v info, -vv debug). `RUST_LOG` overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and its tables. Running it again
    /// is safe.
    Init,

    /// List configured source types and whether their directories exist.
    Sources,

    /// Synchronize the index with the document collection.
    ///
    /// Reindexes documents whose modification time changed, indexes new
    /// ones, and removes documents that disappeared.
    Sync {
        /// Rebuild the whole index from scratch.
        #[arg(long)]
        full: bool,

        /// Progress output on stderr. Defaults to `human` on a terminal.
        #[arg(long, value_enum)]
        progress: Option<progress::ProgressMode>,
    },

    /// Search indexed chunks.
    Search {
        /// The search query string.
        query: String,

        /// Restrict results to one source type.
        #[arg(long)]
        source: Option<String>,

        /// Maximum number of results to return.
        #[arg(long)]
        limit: Option<i64>,
    },

    /// Assemble a request and print it as JSON.
    Assemble {
        /// The new user message.
        message: String,

        /// JSON file with prior conversation turns.
        #[arg(long)]
        history: Option<PathBuf>,

        /// Skip retrieval.
        #[arg(long)]
        no_retrieval: bool,

        /// Retrieve only from this source type.
        #[arg(long)]
        source: Option<String>,
    },

    /// Assemble a request and stream the answer from the backend.
    ///
    /// With `--history`, the exchange is appended to the history file on
    /// success. Ctrl-C cancels the stream.
    Ask {
        /// The new user message.
        message: String,

        /// JSON file with prior conversation turns.
        #[arg(long)]
        history: Option<PathBuf>,

        /// Skip retrieval.
        #[arg(long)]
        no_retrieval: bool,

        /// Retrieve only from this source type.
        #[arg(long)]
        source: Option<String>,
    },

    /// Manage the facts file.
    Facts {
        #[command(subcommand)]
        action: FactsAction,
    },

    /// Show index statistics.
    Stats,
}

#[derive(Subcommand)]
enum FactsAction {
    /// Append a fact. Creates the facts file if it does not exist.
    Add {
        /// The fact, as a single line.
        fact: String,
    },
    /// Print all facts.
    List,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let index = index::SearchIndex::open(&cfg)
                .await
                .context("Failed to initialize database")?;
            index.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Sources => {
            sources::list_sources(&cfg)?;
        }
        Commands::Sync { full, progress } => {
            ingest::run_sync(&cfg, full, progress).await?;
        }
        Commands::Search {
            query,
            source,
            limit,
        } => {
            search::run_search(&cfg, &query, source, limit).await?;
        }
        Commands::Assemble {
            message,
            history,
            no_retrieval,
            source,
        } => {
            let mode = ask::retrieval_mode(no_retrieval, source);
            ask::run_assemble(&cfg, &message, history.as_deref(), mode).await?;
        }
        Commands::Ask {
            message,
            history,
            no_retrieval,
            source,
        } => {
            let mode = ask::retrieval_mode(no_retrieval, source);
            ask::run_ask(&cfg, &message, history.as_deref(), mode).await?;
        }
        Commands::Facts { action } => match action {
            FactsAction::Add { fact } => facts::run_facts_add(&cfg, &fact)?,
            FactsAction::List => facts::run_facts_list(&cfg)?,
        },
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
