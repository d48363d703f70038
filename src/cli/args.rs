//! CLI argument definitions using clap
//!
//! Commands:
//! - dossier-realtime simulate [--config <path>] [--subscriptions <n>]
//! - dossier-realtime check-config --config <path>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// dossier-realtime - live subscriptions and connection health
#[derive(Parser, Debug)]
#[command(name = "dossier-realtime")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a scripted session against the in-memory provider
    Simulate {
        /// Path to configuration file (defaults apply when omitted)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of table subscriptions to open
        #[arg(long, default_value_t = 2)]
        subscriptions: usize,
    },

    /// Validate a configuration file and print the effective values
    CheckConfig {
        /// Path to configuration file
        #[arg(long, default_value = "./realtime.json")]
        config: PathBuf,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
