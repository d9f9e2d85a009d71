//! crag CLI - binary entry point.
//!
//! ```text
//! main() -> init_tracing() -> Cli::parse() -> commands::{index, update,
//!           rebuild, watch, models, chat}
//! ```
//!
//! Ctrl+C cancels the streaming chat turn in flight, or stops the watcher.
//! Logs go to `~/.crag/logs/crag.log` so they never interleave with the
//! streamed reply on stdout.

mod commands;

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crag_config::CragConfig;
use crag_types::ReasoningEffort;

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // No writable log file: stderr keeps stdout clean for streamed replies.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(env_filter)
        .init();
    for warning in init_warnings {
        tracing::warn!("{warning}");
    }
}

fn open_log_file() -> (Option<(PathBuf, File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&candidate)
        {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: ~/.crag/logs/crag.log
    if let Some(dir) = CragConfig::dir() {
        candidates.push(dir.join("logs").join("crag.log"));
    }

    // Fallback: ./.crag/logs/crag.log
    candidates.push(PathBuf::from(".crag").join("logs").join("crag.log"));

    candidates
}

/// Keep a remote knowledge store in sync with local files and chat against it.
#[derive(Debug, Parser)]
#[command(name = "crag", version)]
#[command(after_help = "Examples:\n  crag index 'docs/*.md'\n  crag index 'src/**/*.py' '*.md'\n  crag chat -t h")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub(crate) struct ChatOptions {
    /// Only answer from the indexed files
    #[arg(long)]
    pub strict: bool,

    /// Override reasoning effort (low, medium, high or l, m, h)
    #[arg(short, long, value_name = "LEVEL", value_parser = ReasoningEffort::parse)]
    pub thinking: Option<ReasoningEffort>,

    /// Read one query from stdin and exit
    #[arg(short, long)]
    pub non_interactive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
enum Command {
    /// Upload matching files into a new knowledge store
    Index {
        /// Files, directories or glob patterns
        #[arg(required = true, value_name = "PATTERN")]
        patterns: Vec<String>,
    },

    /// Sync changes of the indexed files
    Update,

    /// Delete the store and index again
    Rebuild {
        /// Defaults to the patterns of the last index
        #[arg(value_name = "PATTERN")]
        patterns: Vec<String>,
    },

    /// Keep the store in sync until Ctrl+C
    Watch,

    /// List available models
    Models,

    /// Chat with the indexed files
    Chat(ChatOptions),
}

/// Ctrl+C sets `cancel` (checked by the streaming turn) and flips `shutdown`
/// (watched by the background watcher).
fn install_interrupt_handler(cancel: Arc<AtomicBool>, shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        while signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received");
            cancel.store(true, Ordering::SeqCst);
            let _ = shutdown.send(true);
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let command = Cli::parse().command;

    let config = match CragConfig::load() {
        Ok(config) => config.unwrap_or_default(),
        Err(e) => {
            eprintln!("Warning: {e}; using defaults");
            CragConfig::default()
        }
    };

    let cancel = Arc::new(AtomicBool::new(false));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    install_interrupt_handler(Arc::clone(&cancel), shutdown_tx);

    let ctx = commands::Context::new(config)?;
    let result = match command {
        Command::Index { patterns } => ctx.index(patterns).await,
        Command::Update => ctx.update().await,
        Command::Rebuild { patterns } => ctx.rebuild(patterns).await,
        Command::Watch => ctx.watch(shutdown_rx).await,
        Command::Models => ctx.models().await,
        Command::Chat(options) => ctx.chat(&options, cancel, shutdown_rx).await,
    };

    if let Err(e) = &result {
        tracing::error!(error = %e, "Command failed");
    }
    result
}
