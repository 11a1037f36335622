//! # Corpus Ledger CLI (`corpus`)
//!
//! Drives scheduled, resumable, deduplicated collection runs over the
//! configured sources.
//!
//! ## Usage
//!
//! ```bash
//! corpus --config ./config/corpus.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `corpus init` | Create the ledger database and schema |
//! | `corpus sources` | List configured sources |
//! | `corpus run [all\|NAME...]` | Run due sources (or the named ones) |
//! | `corpus status [SOURCE]` | Ledger counts, last run, lock, checkpoint, quota |
//! | `corpus reset SOURCE` | Delete a source's records, checkpoint and marker |
//! | `corpus checkpoint show\|clear SOURCE` | Inspect or drop a resume point |
//!
//! ## Examples
//!
//! ```bash
//! # Daily cron entry: runs whatever is due
//! corpus run --config ./config/corpus.toml
//!
//! # Re-collect one source regardless of cadence, capped at 500 items
//! corpus run news --force --limit news=500
//!
//! # Everything except the archive, machine-readable report
//! corpus run all --exclude archive --json
//! ```

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use corpus_ledger::checkpoint::CheckpointManager;
use corpus_ledger::config::{self, Config};
use corpus_ledger::orchestrator::{Orchestrator, RunOptions};
use corpus_ledger::{db, migrate, sources, stats};

/// Corpus Ledger: scheduled, resumable, deduplicated corpus collection.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/corpus.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "corpus",
    about = "Corpus Ledger: scheduled, resumable, deduplicated corpus collection",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/corpus.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the ledger database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// List configured sources with kind, cadence and daily quota.
    Sources,

    /// Run sources that are due.
    ///
    /// With no targets (or `all`) every configured source is considered;
    /// each one still runs only if its cadence has elapsed, unless
    /// `--force` is given. Exits with status 1 if any source failed.
    Run {
        /// Source names, or `all`.
        targets: Vec<String>,

        /// Skip this source (repeatable).
        #[arg(long)]
        exclude: Vec<String>,

        /// Cap discovered items for a source this run, as NAME=N (repeatable).
        #[arg(long = "limit", value_parser = parse_key_val)]
        limits: Vec<(String, String)>,

        /// Ignore cadence, known keys and stored validators.
        #[arg(long)]
        force: bool,

        /// Print the run report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show ledger status per source.
    Status {
        /// Limit output to one source.
        source: Option<String>,
    },

    /// Administrative reset.
    ///
    /// Without `--key`, deletes every ledger record of SOURCE along with its
    /// checkpoint and completion marker. With `--key`, resets that one
    /// record to `discovered` so the next run reprocesses it.
    Reset {
        source: String,

        #[arg(long)]
        key: Option<String>,
    },

    /// Inspect or clear a source's checkpoint.
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// Print the checkpoint and completion marker as JSON.
    Show { source: String },
    /// Delete the checkpoint and completion marker.
    Clear { source: String },
}

/// Parse a `key=value` pair for `--limit` arguments.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run_options(
    targets: Vec<String>,
    exclude: Vec<String>,
    limits: Vec<(String, String)>,
    force: bool,
) -> Result<RunOptions> {
    let only = if targets.iter().any(|t| t == "all") {
        Vec::new()
    } else {
        targets
    };
    let mut parsed = HashMap::new();
    for (name, value) in limits {
        let Ok(n) = value.parse::<u64>() else {
            bail!("--limit {}={}: expected a non-negative integer", name, value);
        };
        parsed.insert(name, n);
    }
    Ok(RunOptions {
        only,
        exclude,
        limits: parsed,
        force,
    })
}

fn ensure_source(cfg: &Config, source: &str) -> Result<()> {
    if !cfg.sources.contains_key(source) {
        bail!("Unknown source: '{}'", source);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Ledger initialized successfully.");
        }
        Commands::Sources => {
            sources::list_sources(&cfg)?;
        }
        Commands::Run {
            targets,
            exclude,
            limits,
            force,
            json,
        } => {
            let opts = run_options(targets, exclude, limits, force)?;
            let orchestrator = Orchestrator::from_config(&cfg).await?;

            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupt received, finishing in-flight items");
                    let _ = shutdown_tx.send(true);
                }
            });

            let report = orchestrator.run(&opts, shutdown_rx).await?;
            if json {
                println!("{}", report.to_json()?);
            } else {
                report.print_human();
            }
            std::process::exit(report.exit_code());
        }
        Commands::Status { source } => {
            stats::run_status(&cfg, source.as_deref()).await?;
        }
        Commands::Reset { source, key } => {
            ensure_source(&cfg, &source)?;
            let ledger = db::open_ledger(&cfg).await?;
            match key {
                Some(key) => {
                    if ledger.force_reprocess(&source, &key).await? {
                        println!("Reset {}/{} to discovered.", source, key);
                    } else {
                        bail!("No record '{}' in source '{}'", key, source);
                    }
                }
                None => {
                    let deleted = ledger.reset_source(&source).await?;
                    CheckpointManager::new(cfg.staging.root.clone())
                        .reset(&source)
                        .await?;
                    println!("Deleted {} records of {}; checkpoint cleared.", deleted, source);
                }
            }
        }
        Commands::Checkpoint { action } => {
            let checkpoints = CheckpointManager::new(cfg.staging.root.clone());
            match action {
                CheckpointAction::Show { source } => {
                    ensure_source(&cfg, &source)?;
                    let value = serde_json::json!({
                        "source": source,
                        "checkpoint": checkpoints.load(&source).await,
                        "completion": checkpoints.completion(&source).await,
                    });
                    println!("{}", serde_json::to_string_pretty(&value)?);
                }
                CheckpointAction::Clear { source } => {
                    ensure_source(&cfg, &source)?;
                    checkpoints.reset(&source).await?;
                    println!("Checkpoint cleared for {}.", source);
                }
            }
        }
    }

    Ok(())
}
