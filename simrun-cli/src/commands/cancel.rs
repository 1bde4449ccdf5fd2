//! Cancel command handler

use anyhow::{Context, Result, bail};
use colored::*;
use simrun_core::RunDir;
use simrun_runner::process_alive;
use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;
use tracing::warn;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Asks the agent supervising `run_dir` to cancel its job
///
/// The agent owns the job, so the request is a SIGTERM to the agent, which
/// then kills the job with its grace period and writes `out.json`.
pub async fn handle_cancel(run_dir: &Path, wait: bool, wait_timeout: u64) -> Result<ExitCode> {
    let run_dir = RunDir::open(run_dir)
        .with_context(|| format!("Cannot open run directory {}", run_dir.display()))?;

    let Some(record) = run_dir.read_handle()? else {
        if let Some(output) = run_dir.read_output()? {
            println!(
                "{}",
                format!("Job already finished: {}", output.state).yellow()
            );
            return Ok(ExitCode::SUCCESS);
        }
        bail!("No job is running in {}", run_dir.path().display());
    };

    if !process_alive(record.agent_pid) {
        warn!(
            "Agent {} is gone; removing stale handle {}",
            record.agent_pid, record.handle_id
        );
        run_dir.clear_handle()?;
        bail!("Agent {} is not running", record.agent_pid);
    }

    terminate(record.agent_pid)
        .with_context(|| format!("Failed to signal agent {}", record.agent_pid))?;
    println!(
        "{}",
        format!("Cancel requested for job {}", record.handle_id).green()
    );

    if !wait {
        return Ok(ExitCode::SUCCESS);
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(wait_timeout);
    loop {
        if let Some(output) = run_dir.read_output()? {
            println!("Job finished: {}", output.state);
            return Ok(ExitCode::SUCCESS);
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("Job did not finish within {}s", wait_timeout);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[cfg(unix)]
fn terminate(pid: u32) -> std::io::Result<()> {
    let pid = i32::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: plain signal delivery to a single process
    if unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn terminate(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "cancel is only supported on unix",
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use chrono::Utc;
    use simrun_core::domain::handle::HandleRecord;
    use simrun_core::domain::job::{Backend, JobOutput, JobState};
    use std::os::unix::process::ExitStatusExt;

    fn output(state: JobState) -> JobOutput {
        JobOutput {
            state,
            sim_type: "elegant".to_string(),
            backend: Backend::Local,
            exit_code: None,
            error: None,
            started_at: Utc::now(),
            completed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_cancel_signals_agent() {
        let tmp = tempfile::tempdir().unwrap();
        let run_dir = RunDir::open(tmp.path()).unwrap();
        let mut agent = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let record = HandleRecord::new(Backend::Local, "4242", agent.id().unwrap());
        run_dir.write_handle(&record).unwrap();

        handle_cancel(tmp.path(), false, 5).await.unwrap();

        let status = tokio::time::timeout(Duration::from_secs(5), agent.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.signal(), Some(libc::SIGTERM));
    }

    #[tokio::test]
    async fn test_cancel_waits_for_output() {
        let tmp = tempfile::tempdir().unwrap();
        let run_dir = RunDir::open(tmp.path()).unwrap();
        let mut agent = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let record = HandleRecord::new(Backend::Local, "4242", agent.id().unwrap());
        run_dir.write_handle(&record).unwrap();

        // Stands in for the agent reporting the canceled job
        let writer = tokio::spawn({
            let run_dir = run_dir.clone();
            async move {
                agent.wait().await.unwrap();
                run_dir.clear_handle().unwrap();
                run_dir.write_output(&output(JobState::Canceled)).unwrap();
            }
        });

        handle_cancel(tmp.path(), true, 10).await.unwrap();
        writer.await.unwrap();
        assert_eq!(
            run_dir.read_output().unwrap().unwrap().state,
            JobState::Canceled
        );
    }

    #[tokio::test]
    async fn test_cancel_with_dead_agent_clears_handle() {
        let tmp = tempfile::tempdir().unwrap();
        let run_dir = RunDir::open(tmp.path()).unwrap();
        let mut gone = tokio::process::Command::new("true").spawn().unwrap();
        let pid = gone.id().unwrap();
        gone.wait().await.unwrap();
        run_dir
            .write_handle(&HandleRecord::new(Backend::Local, "4242", pid))
            .unwrap();

        let err = handle_cancel(tmp.path(), false, 5).await.unwrap_err();
        assert!(err.to_string().contains("not running"));
        assert!(run_dir.read_handle().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_finished_job_is_ok() {
        let tmp = tempfile::tempdir().unwrap();
        let run_dir = RunDir::open(tmp.path()).unwrap();
        run_dir.write_output(&output(JobState::Completed)).unwrap();

        assert!(handle_cancel(tmp.path(), false, 5).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_without_job_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(handle_cancel(tmp.path(), false, 5).await.is_err());
    }
}
