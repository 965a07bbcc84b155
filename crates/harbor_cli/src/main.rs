//! Harbor CLI
//!
//! Command-line tools for inspecting harbor store directories.
//!
//! # Commands
//!
//! - `inspect` - Display backend, sizes and collection counts
//! - `queue` - List pending mutations in delivery order
//! - `records` - List records, optionally by status
//! - `sweep` - Remove expired cache entries
//! - `evict` - Evict aged flat-backend entries

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Harbor store inspection tools.
#[derive(Parser)]
#[command(name = "harbor")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
    #[arg(global = true, short, long)]
    dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display backend, sizes and collection counts
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List pending mutations in delivery order
    Queue {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List records
    Records {
        /// Only records with this status (synced, pending-local, deleted-local)
        #[arg(short, long)]
        status: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Remove expired cache entries
    Sweep {
        /// Dry run - only count expired entries
        #[arg(short = 'n', long)]
        dry_run: bool,
    },

    /// Evict aged entries from the flat backend
    Evict {
        /// Entries older than this many days are evicted
        #[arg(long, default_value = "7")]
        days: u64,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { format } => {
            let dir = cli.dir.ok_or("Store directory required for inspect")?;
            commands::inspect::run(&dir, &format)?;
        }
        Commands::Queue { format } => {
            let dir = cli.dir.ok_or("Store directory required for queue")?;
            commands::queue::run(&dir, &format)?;
        }
        Commands::Records { status, format } => {
            let dir = cli.dir.ok_or("Store directory required for records")?;
            commands::records::run(&dir, status.as_deref(), &format)?;
        }
        Commands::Sweep { dry_run } => {
            let dir = cli.dir.ok_or("Store directory required for sweep")?;
            commands::sweep::run(&dir, dry_run)?;
        }
        Commands::Evict { days } => {
            let dir = cli.dir.ok_or("Store directory required for evict")?;
            commands::evict::run(&dir, days)?;
        }
        Commands::Version => {
            println!("Harbor CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
