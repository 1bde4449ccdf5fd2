//! Run command handlers

use anyhow::{Context, Result};
use colored::*;
use simrun_core::RunDir;
use simrun_core::domain::job::{JobOutput, JobState};
use simrun_runner::{JobAgent, RunMode, cancel_on_signal};
use std::path::Path;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::exit_code;
use crate::config::Overrides;

/// Runs the job in `run_dir` in this process
///
/// SIGTERM and Ctrl-C cancel the job; the exit code mirrors the job's.
pub async fn handle_run(run_dir: &Path, background: bool, overrides: &Overrides) -> Result<ExitCode> {
    let config = overrides.load()?;
    let run_dir = RunDir::open(run_dir)
        .with_context(|| format!("Cannot open run directory {}", run_dir.display()))?;
    let mode = if background {
        RunMode::Background
    } else {
        RunMode::Foreground
    };

    info!("Supervising {} ({:?})", run_dir.path().display(), mode);

    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone());

    let agent = JobAgent::new(config);
    let output = agent
        .run(&run_dir, mode, cancel)
        .await
        .with_context(|| format!("Job in {} failed to run", run_dir.path().display()))?;

    print_outcome(&output);
    Ok(exit_code(output.process_exit_code()))
}

fn print_outcome(output: &JobOutput) {
    let state = colorize_state(output.state);
    let elapsed = output.completed_at - output.started_at;
    println!(
        "{} {} {} in {:.1}s",
        "▸".cyan(),
        output.sim_type.bold(),
        state,
        elapsed.num_milliseconds() as f64 / 1000.0
    );
    if let Some(error) = &output.error {
        for line in error.lines() {
            println!("  {}", line.red());
        }
    }
}

/// Colorize a job state for display
pub fn colorize_state(state: JobState) -> ColoredString {
    match state {
        JobState::Completed => "completed".green(),
        JobState::Error => "error".red(),
        JobState::Canceled => "canceled".yellow(),
        JobState::TimedOut => "timed out".yellow(),
    }
}
