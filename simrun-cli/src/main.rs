//! simrun CLI
//!
//! Runs simulation jobs in their run directories and inspects or cancels
//! them from another shell.

mod commands;
mod config;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, handle_command};
use config::Overrides;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Log directives used when RUST_LOG is unset; `simrun` is this binary's target
const DEFAULT_LOG_FILTER: &str = "simrun=info,simrun_runner=info";

#[derive(Parser)]
#[command(name = "simrun")]
#[command(about = "Simulation job supervisor", long_about = None)]
struct Cli {
    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Job output goes to run.log, diagnostics to stderr
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    handle_command(cli.command, &cli.overrides).await
}
