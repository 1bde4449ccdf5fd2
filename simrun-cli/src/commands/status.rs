//! Status command handler

use anyhow::{Context, Result};
use chrono::Utc;
use colored::*;
use simrun_core::RunDir;
use simrun_core::domain::handle::HandleRecord;
use simrun_core::domain::job::JobOutput;
use simrun_runner::process_alive;
use std::path::Path;
use std::process::ExitCode;

use super::run::colorize_state;

/// Prints what is known about `run_dir`
///
/// A live handle record wins over a previous `out.json`.
pub fn handle_status(run_dir: &Path, log: Option<usize>, json: bool) -> Result<ExitCode> {
    let run_dir = RunDir::open(run_dir)
        .with_context(|| format!("Cannot open run directory {}", run_dir.display()))?;

    let handle = run_dir.read_handle()?;
    let output = run_dir.read_output()?;

    if json {
        let value = match (&handle, &output) {
            (Some(record), _) => serde_json::to_value(record)?,
            (None, Some(output)) => serde_json::to_value(output)?,
            (None, None) => serde_json::Value::Null,
        };
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(ExitCode::SUCCESS);
    }

    match (&handle, &output) {
        (Some(record), _) => print_running(record),
        (None, Some(output)) => print_finished(output),
        (None, None) => println!("{}", "No job has run in this directory.".yellow()),
    }

    if let Some(lines) = log {
        let tail = run_dir.log_tail(lines)?;
        if tail.is_empty() {
            println!("{}", "run.log is empty.".dimmed());
        } else {
            println!("{}", "─".repeat(80).dimmed());
            for line in tail {
                println!("{}", line);
            }
            println!("{}", "─".repeat(80).dimmed());
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn print_running(record: &HandleRecord) {
    let state = if process_alive(record.agent_pid) {
        "running".blue()
    } else {
        "stale".red()
    };
    let elapsed = Utc::now() - record.started_at;
    println!("  State:    {}", state);
    println!("  Backend:  {}", record.backend);
    if record.handle_id.is_empty() {
        println!("  Handle:   {}", "(starting)".dimmed());
    } else {
        println!("  Handle:   {}", record.handle_id.dimmed());
    }
    println!("  Agent:    {}", record.agent_pid);
    println!(
        "  Started:  {} ({}s ago)",
        record.started_at.format("%Y-%m-%d %H:%M:%S"),
        elapsed.num_seconds()
    );
}

fn print_finished(output: &JobOutput) {
    println!("  State:     {}", colorize_state(output.state));
    println!("  Sim type:  {}", output.sim_type);
    println!("  Backend:   {}", output.backend);
    if let Some(code) = output.exit_code {
        println!("  Exit code: {}", code);
    }
    println!(
        "  Finished:  {}",
        output.completed_at.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(error) = &output.error {
        println!("  Error:");
        for line in error.lines() {
            println!("    {}", line.red());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simrun_core::domain::job::{Backend, JobState};

    #[test]
    fn test_status_of_empty_dir() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(handle_status(tmp.path(), Some(10), false).is_ok());
        assert!(handle_status(tmp.path(), None, true).is_ok());
    }

    #[test]
    fn test_status_of_running_and_finished_job() {
        let tmp = tempfile::tempdir().unwrap();
        let run_dir = RunDir::open(tmp.path()).unwrap();
        std::fs::write(run_dir.log_path(), "step 1\nError: boom\n").unwrap();
        run_dir
            .write_output(&JobOutput {
                state: JobState::Error,
                sim_type: "elegant".to_string(),
                backend: Backend::Local,
                exit_code: Some(1),
                error: Some("Error: boom".to_string()),
                started_at: Utc::now(),
                completed_at: Utc::now(),
            })
            .unwrap();
        assert!(handle_status(tmp.path(), Some(5), false).is_ok());
        assert!(handle_status(tmp.path(), None, true).is_ok());

        let record = HandleRecord::new(Backend::Docker, "", std::process::id());
        run_dir.write_handle(&record).unwrap();
        assert!(handle_status(tmp.path(), None, false).is_ok());
        assert!(handle_status(tmp.path(), None, true).is_ok());
    }

    #[test]
    fn test_status_of_missing_dir_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(handle_status(&tmp.path().join("absent"), None, false).is_err());
    }
}
