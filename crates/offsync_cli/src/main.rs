//! offsync CLI
//!
//! Command-line tools for inspecting and repairing an offsync journal
//! without starting the engine.
//!
//! # Commands
//!
//! - `stats` - Queue, sync and conflict counters
//! - `ops` - List queued operations
//! - `retry-failed` - Requeue operations that exhausted their attempts
//! - `conflicts` - List conflicts
//! - `history` - Show conflict resolution history
//! - `prune` - Delete old resolved conflicts
//! - `compact` - Rewrite the journal to its live state

mod commands;

use clap::{Parser, Subcommand};
use commands::Format;
use offsync_protocol::OperationStatus;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// offsync journal tools.
#[derive(Parser)]
#[command(name = "offsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the journal file
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Engine configuration (JSON)
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(global = true, short, long, value_enum, default_value = "text")]
    format: Format,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show queue, sync and conflict counters
    Stats,

    /// List queued operations in delivery order
    Ops {
        /// Only operations with this status
        #[arg(short, long)]
        status: Option<OperationStatus>,
    },

    /// Requeue operations that exhausted their attempts
    RetryFailed,

    /// List conflicts
    Conflicts {
        /// Include resolved conflicts
        #[arg(short, long)]
        all: bool,
    },

    /// Show conflict resolution history
    History {
        /// Only this entity kind
        #[arg(short, long)]
        kind: Option<String>,
    },

    /// Delete resolved conflicts older than the retention period
    Prune {
        /// Retention in days (defaults to the configured retention)
        #[arg(short, long)]
        days: Option<u32>,
    },

    /// Rewrite the journal to its live state
    Compact,

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Version = cli.command {
        println!("offsync CLI v{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let path = cli.path.ok_or("Journal path required (--path)")?;
    let ctx = commands::Context::open(&path, cli.config.as_deref(), cli.format)?;

    match cli.command {
        Commands::Stats => commands::stats::run(&ctx)?,
        Commands::Ops { status } => commands::ops::run(&ctx, status)?,
        Commands::RetryFailed => commands::ops::retry_failed(&ctx)?,
        Commands::Conflicts { all } => commands::conflicts::list(&ctx, all)?,
        Commands::History { kind } => commands::conflicts::history(&ctx, kind.as_deref())?,
        Commands::Prune { days } => commands::conflicts::prune(&ctx, days)?,
        Commands::Compact => commands::compact::run(&ctx)?,
        Commands::Version => {}
    }

    Ok(())
}
