//! # Content Sync CLI (`csync`)
//!
//! Operator interface for the content versioning ledger and the search-index
//! synchronization pipeline.
//!
//! ## Usage
//!
//! ```bash
//! csync --config ./config/csync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `csync init` | Create the SQLite database and run schema migrations |
//! | `csync content create\|update\|delete\|restore` | Mutate content through Change Capture |
//! | `csync history <id>` | Print the version ledger for one item |
//! | `csync status <id>` | Compare the ledger head with the indexed version |
//! | `csync relay` | Forward pending outbox rows to the queue |
//! | `csync work` | Run extraction and indexing workers |
//! | `csync reconcile` | Compare ledger heads with the index and re-drive drift |
//! | `csync dead-letters list\|requeue` | Inspect or re-queue dead-lettered work |
//! | `csync search "<query>"` | Keyword search over the index |
//! | `csync suggest <prefix>` | Completion suggestions |
//! | `csync stats` | Pipeline health overview |

use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;

use content_sync::capture::ContentPatch;
use content_sync::config::{self, LoggingConfig};
use content_sync::context::PipelineContext;
use content_sync::{content_cmd, migrate, pipeline_cmd, search, stats};

/// Content Sync CLI: version ledger and search-index synchronization for
/// learning content.
///
/// All commands except `completions` read a TOML configuration file. See
/// `config/csync.example.toml` for every option and its default.
#[derive(Parser)]
#[command(
    name = "csync",
    about = "Content Sync: version ledger and search-index synchronization for learning content",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/csync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Create, update, delete or restore content.
    ///
    /// Every successful mutation appends a version event and an outbox row
    /// in the same transaction.
    Content {
        #[command(subcommand)]
        action: ContentAction,
    },

    /// Print the version ledger for a content item.
    History { id: String },

    /// Show ledger head, indexed version and pending work for a content item.
    Status { id: String },

    /// Forward pending outbox rows to the task queue.
    Relay {
        /// Keep relaying every `[relay] interval_ms` until Ctrl-C.
        #[arg(long)]
        watch: bool,
    },

    /// Run extraction and indexing workers.
    Work {
        /// Process until no eligible work remains, then exit.
        #[arg(long)]
        drain: bool,
    },

    /// Compare ledger heads with the search index and re-enqueue drift.
    Reconcile {
        /// Keep reconciling every `[reconciler] interval_secs` until Ctrl-C.
        #[arg(long)]
        watch: bool,
    },

    /// Inspect and re-queue dead-lettered work items.
    DeadLetters {
        #[command(subcommand)]
        action: DeadLetterAction,
    },

    /// Keyword search over indexed content.
    Search {
        query: String,

        /// Maximum number of results to return.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Completion suggestions for a prefix.
    Suggest {
        prefix: String,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Pipeline statistics.
    Stats,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for (bash, zsh, fish, elvish, powershell).
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ContentAction {
    /// Create a content item at version 1.
    Create {
        /// Identifier. Generated when omitted.
        #[arg(long)]
        id: Option<String>,

        /// Content kind: `document`, `video` or `assignment`.
        #[arg(long)]
        kind: String,

        /// Raw-source reference: `object://`, `file://`, `http(s)://` or `inline:`.
        #[arg(long = "source")]
        source_ref: String,

        #[arg(long)]
        title: String,

        #[arg(long)]
        description: Option<String>,
    },
    /// Update fields of an existing item.
    Update {
        id: String,

        #[arg(long = "source")]
        source_ref: Option<String>,

        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        description: Option<String>,
    },
    /// Soft-delete an item.
    Delete { id: String },
    /// Restore a soft-deleted item.
    Restore { id: String },
}

#[derive(Subcommand)]
enum DeadLetterAction {
    /// List dead-lettered work items, most recent first.
    List {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Return a dead-lettered item to the queue with a fresh attempt budget.
    Requeue { id: String },
}

fn init_logging(logging: &LoggingConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("content_sync={},csync={}", logging.level, logging.level)));

    let (json, text) = if logging.json {
        (Some(fmt::layer().json().with_writer(std::io::stderr)), None)
    } else {
        (None, Some(fmt::layer().with_writer(std::io::stderr)))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Commands that don't require config
    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "csync", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;
    init_logging(&cfg.logging);

    if let Commands::Init = cli.command {
        migrate::run_migrations(&cfg).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let ctx = PipelineContext::open(cfg).await?;
    let result = dispatch(&ctx, cli.command).await;
    ctx.close().await;
    result
}

async fn dispatch(ctx: &PipelineContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Content { action } => match action {
            ContentAction::Create {
                id,
                kind,
                source_ref,
                title,
                description,
            } => content_cmd::run_create(ctx, id, &kind, source_ref, title, description).await,
            ContentAction::Update {
                id,
                source_ref,
                title,
                description,
            } => {
                let patch = ContentPatch {
                    source_ref,
                    title,
                    description,
                };
                content_cmd::run_update(ctx, &id, patch).await
            }
            ContentAction::Delete { id } => content_cmd::run_delete(ctx, &id).await,
            ContentAction::Restore { id } => content_cmd::run_restore(ctx, &id).await,
        },
        Commands::History { id } => content_cmd::run_history(ctx, &id).await,
        Commands::Status { id } => content_cmd::run_status(ctx, &id).await,
        Commands::Relay { watch } => pipeline_cmd::run_relay(ctx, watch).await,
        Commands::Work { drain } => pipeline_cmd::run_work(ctx, drain).await,
        Commands::Reconcile { watch } => pipeline_cmd::run_reconcile(ctx, watch).await,
        Commands::DeadLetters { action } => match action {
            DeadLetterAction::List { limit } => pipeline_cmd::run_dead_letters(ctx, limit).await,
            DeadLetterAction::Requeue { id } => pipeline_cmd::run_requeue(ctx, &id).await,
        },
        Commands::Search { query, limit } => search::run_search(ctx, &query, limit).await,
        Commands::Suggest { prefix, limit } => search::run_suggest(ctx, &prefix, limit).await,
        Commands::Stats => stats::run_stats(ctx).await,
        // Handled before config loading
        Commands::Init | Commands::Completions { .. } => Ok(()),
    }
}
