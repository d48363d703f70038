//! CLI module for dossier-realtime
//!
//! Provides command-line interface for:
//! - simulate: scripted subscribe / drop / reconnect session in memory
//! - check-config: validate a configuration file

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{check_config, run, run_command, run_simulation, simulate};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{write_response, write_response_to};
