//! # wikirag CLI
//!
//! The `wikirag` binary syncs a local Wikipedia corpus into a Gemini File
//! Search store and answers questions against it.
//!
//! ## Usage
//!
//! ```bash
//! wikirag --config ./config/wikirag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `wikirag sync` | Upload new and changed documents (`--reset` to rebuild) |
//! | `wikirag ask "<question>"` | Grounded answer with resolved citations |
//! | `wikirag files` | Mapping table joined with the live store listing |
//! | `wikirag info` | Store status and document counts |
//! | `wikirag forget <name>` | Remove one document from the store and the table |
//! | `wikirag id <name>...` | Print the safe id each local name uploads as |
//! | `wikirag store list` | Stores visible to the API key |
//! | `wikirag store delete` | Delete a store and all of its documents |
//! | `wikirag completions <shell>` | Shell completion script |
//!
//! The API key is read from `GOOGLE_API_KEY` (or `[api] api_key_env`).
//! `STORE_NAME`, `GEMINI_MODEL` and `UPLOAD_TIMEOUT_SECS` override the file.
//! A `.env` file in the working directory is loaded first.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use wikirag::config::{self, Config};
use wikirag::progress::ProgressMode;
use wikirag::sync::SyncArgs;
use wikirag::{normalize, query, stores, sync};

const DEFAULT_CONFIG: &str = "./config/wikirag.toml";

/// wikirag: retrieval-augmented answers over a local Wikipedia corpus,
/// backed by Gemini File Search.
#[derive(Parser)]
#[command(name = "wikirag", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/wikirag.toml`; when that file does not exist
    /// the built-in defaults are used.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override `[corpus] mapping_file`.
    #[arg(long, global = true)]
    mapping_file: Option<PathBuf>,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload new and changed documents to the store.
    ///
    /// Documents whose content fingerprint matches the mapping file are
    /// skipped. Completed uploads are recorded immediately, so an
    /// interrupted sync resumes where it stopped.
    Sync {
        /// Corpus directory. Defaults to `[corpus] root`.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Delete every document in the store and upload the corpus again.
        #[arg(long)]
        reset: bool,

        /// Skip the reset confirmation prompt.
        #[arg(long, short = 'y')]
        yes: bool,

        /// Classify documents and print the plan without uploading.
        #[arg(long)]
        dry_run: bool,

        /// Progress output on stderr. Defaults to `human` on a terminal.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Ask a question grounded in the store.
    Ask {
        /// The question.
        question: String,

        /// Print the answer and citations as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List tracked documents and whether each is present in the store.
    Files,

    /// Show store status and document counts.
    Info,

    /// Delete one document from the store and drop its mapping record.
    Forget {
        /// Local file name as recorded in the mapping file.
        local_name: String,
    },

    /// Print the safe id each local name would be uploaded under.
    Id {
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Manage File Search stores.
    Store {
        #[command(subcommand)]
        action: StoreAction,
    },

    /// Generate a shell completion script.
    Completions {
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum StoreAction {
    /// List stores visible to the API key. `*` marks the configured store.
    List,
    /// Delete a store and all of its documents.
    Delete {
        /// Store resource name. Defaults to the configured store.
        name: Option<String>,

        /// Skip the typed confirmation.
        #[arg(long)]
        yes: bool,
    },
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log filter '{}'", level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    Ok(())
}

fn load(cli: &Cli) -> Result<Config> {
    let mut cfg = match &cli.config {
        Some(path) => config::load_config(path)?,
        None if Path::new(DEFAULT_CONFIG).exists() => {
            config::load_config(Path::new(DEFAULT_CONFIG))?
        }
        None => Config::minimal(),
    };
    cfg.apply_env()?;
    if let Some(mapping_file) = &cli.mapping_file {
        cfg.corpus.mapping_file = mapping_file.clone();
    }
    Ok(cfg)
}

fn print_ids(names: &[String]) -> Result<()> {
    let assigned = normalize::assign_safe_ids(names.iter().map(String::as_str))?;
    for name in names {
        let safe_id = assigned
            .get(name)
            .cloned()
            .unwrap_or_else(|| normalize::normalize(name));
        println!("{}\t{}", name, safe_id);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    // Commands that don't require config
    match &cli.command {
        Commands::Id { names } => return print_ids(names),
        Commands::Completions { shell } => {
            clap_complete::generate(*shell, &mut Cli::command(), "wikirag", &mut std::io::stdout());
            return Ok(());
        }
        _ => {}
    }

    let cfg = load(&cli)?;

    match cli.command {
        Commands::Sync {
            data_dir,
            reset,
            yes,
            dry_run,
            progress,
        } => {
            let args = SyncArgs {
                data_dir,
                reset,
                yes,
                dry_run,
                progress: progress.unwrap_or_else(ProgressMode::default_for_tty),
            };
            sync::run_sync(&cfg, args).await?;
        }
        Commands::Ask { question, json } => {
            query::run_ask(&cfg, &question, json).await?;
        }
        Commands::Files => {
            query::run_files(&cfg).await?;
        }
        Commands::Info => {
            query::run_info(&cfg).await?;
        }
        Commands::Forget { local_name } => {
            stores::run_forget(&cfg, &local_name).await?;
        }
        Commands::Store { action } => match action {
            StoreAction::List => stores::run_store_list(&cfg).await?,
            StoreAction::Delete { name, yes } => stores::run_store_delete(&cfg, name, yes).await?,
        },
        Commands::Id { .. } | Commands::Completions { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}
