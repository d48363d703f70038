//! dossier-realtime CLI entry point
//!
//! Installs logging, then hands everything to the CLI module. Errors go
//! to stderr with a non-zero exit.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dossier_realtime::cli;

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dossier_realtime=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = cli::run() {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
