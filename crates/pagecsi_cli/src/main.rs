//! pagecsi CLI
//!
//! Command-line tools for page-checksummed files.
//!
//! # Commands
//!
//! - `inspect` - Display a file's tag file header and tags
//! - `verify` - Check every page of a file against its stored tag

mod commands;

use clap::{Parser, Subcommand};
use pagecsi_core::{CsiConfig, DEFAULT_TAG_SUFFIX};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// pagecsi command-line tools.
#[derive(Parser)]
#[command(name = "pagecsi")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Suffix naming the tag file next to each data file
    #[arg(global = true, long, default_value = DEFAULT_TAG_SUFFIX)]
    tag_suffix: String,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display tag file header and sizes
    Inspect {
        /// Path to the data file
        path: PathBuf,

        /// Print every page tag
        #[arg(short, long)]
        tags: bool,
    },

    /// Verify every page of a file against its tags
    Verify {
        /// Path to the data file
        path: PathBuf,

        /// Pages read per verification chunk
        #[arg(short, long, default_value = "256")]
        chunk_pages: usize,

        /// Fail if the file has no tag file
        #[arg(short, long)]
        require_tags: bool,
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

    let config = CsiConfig::default().tag_suffix(cli.tag_suffix);

    match cli.command {
        Commands::Inspect { path, tags } => {
            commands::inspect::run(&path, &config, tags)?;
        }
        Commands::Verify {
            path,
            chunk_pages,
            require_tags,
        } => {
            let config = config.allow_missing_tags(!require_tags);
            commands::verify::run(&path, config, chunk_pages)?;
        }
        Commands::Version => {
            println!("pagecsi CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("pagecsi Core v{}", pagecsi_core::VERSION);
        }
    }

    Ok(())
}
