//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod cancel;
mod first_rank;
mod run;
mod status;

use anyhow::Result;
use clap::Subcommand;
use std::path::PathBuf;
use std::process::ExitCode;

use crate::config::Overrides;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run the job in a run directory on a single rank
    Run {
        /// Run directory containing in.json
        run_dir: PathBuf,
    },
    /// Run the job in a run directory with the configured MPI cores
    RunBackground {
        /// Run directory containing in.json
        run_dir: PathBuf,
    },
    /// Show the state of a run directory
    Status {
        run_dir: PathBuf,

        /// Also print the last N lines of run.log
        #[arg(long, value_name = "N")]
        log: Option<usize>,

        /// Print the handle or output record as JSON
        #[arg(long)]
        json: bool,
    },
    /// Cancel the job running in a run directory
    Cancel {
        run_dir: PathBuf,

        /// Wait until the job has written out.json
        #[arg(long)]
        wait: bool,

        /// Seconds to wait for out.json
        #[arg(long, default_value_t = 60)]
        wait_timeout: u64,
    },
    /// Run a program on MPI rank 0 only; every rank exits with its outcome
    FirstRank {
        /// Directory shared by all ranks
        #[arg(long, env = "SIMRUN_RUN_DIR", default_value = ".")]
        dir: PathBuf,

        /// Program and arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
}

/// Handle a CLI command
///
/// Routes the command to the appropriate handler module. The returned exit
/// code mirrors the job where there is one.
pub async fn handle_command(command: Commands, overrides: &Overrides) -> Result<ExitCode> {
    match command {
        Commands::Run { run_dir } => run::handle_run(&run_dir, false, overrides).await,
        Commands::RunBackground { run_dir } => run::handle_run(&run_dir, true, overrides).await,
        Commands::Status { run_dir, log, json } => status::handle_status(&run_dir, log, json),
        Commands::Cancel {
            run_dir,
            wait,
            wait_timeout,
        } => cancel::handle_cancel(&run_dir, wait, wait_timeout).await,
        Commands::FirstRank { dir, command } => first_rank::handle_first_rank(&dir, &command).await,
    }
}

/// Exit code for a process exit status, clamped to what a shell can see
fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
