//! Job agent
//!
//! Supervises one run directory end to end: reads `in.json`, starts the job
//! on the selected backend, records the handle, waits for exit while reacting
//! to cancellation and the job timeout, then writes `out.json`.

use chrono::Utc;
use simrun_core::RunDir;
use simrun_core::domain::handle::HandleRecord;
use simrun_core::domain::job::{Backend, ExitState, JobOutput, JobState, KillReason};
use simrun_core::dto::job::JobInput;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::driver::{DockerLauncher, LaunchSpec, Launcher, LocalLauncher, ProcessHandle};
use crate::env;
use crate::error::{Result, RunnerError};
use crate::mpi::{self, MpiCommand};
use crate::scrape::ErrorScraper;

/// How many ranks a job gets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Interactive run, always a single rank
    Foreground,
    /// Batch run with the configured MPI core count
    Background,
}

/// Supervises jobs with a fixed configuration
pub struct JobAgent {
    config: Config,
    local: LocalLauncher,
    docker: DockerLauncher,
}

impl JobAgent {
    pub fn new(config: Config) -> Self {
        let docker = DockerLauncher::new(config.docker_options());
        Self {
            config,
            local: LocalLauncher::new(),
            docker,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn launcher(&self, backend: Backend) -> &dyn Launcher {
        match backend {
            Backend::Local => &self.local,
            Backend::Docker => &self.docker,
        }
    }

    /// Cores the job runs with in `mode`
    pub fn cores(&self, input: &JobInput, mode: RunMode) -> usize {
        match mode {
            RunMode::Foreground => 1,
            RunMode::Background => input.mpi_cores.unwrap_or(self.config.mpi_cores).max(1),
        }
    }

    /// Builds the launch spec of `input`, wrapped in `mpiexec` when parallel
    pub fn launch_spec(&self, run_dir: &RunDir, input: &JobInput, cores: usize) -> LaunchSpec {
        let mpi = MpiCommand::new(self.config.mpiexec.clone(), cores);
        let (program, args) = mpi.wrap(input.program(), input.args());
        LaunchSpec {
            run_dir: run_dir.path().to_path_buf(),
            program,
            args,
            env: env::job_env(&self.config, cores, &input.env),
            image: input.image.clone(),
        }
    }

    /// Runs the job of `run_dir` to completion
    ///
    /// Cancelling `cancel` kills the job with the configured grace period.
    /// The outcome is written to `out.json` and returned. Errors are
    /// returned only when the job could not be started or supervised; a job
    /// that fails is an `Ok` output with state `Error`.
    pub async fn run(
        &self,
        run_dir: &RunDir,
        mode: RunMode,
        cancel: CancellationToken,
    ) -> Result<JobOutput> {
        let input = run_dir.read_input()?;
        let backend = input.backend.unwrap_or(self.config.backend);
        let mut record = claim(run_dir, backend)?;
        if let Err(e) = run_dir.clear_output() {
            run_dir.remove_handle_if(&record)?;
            return Err(e.into());
        }

        let cores = self.cores(&input, mode);
        let scraper = match ErrorScraper::new(&input.error_patterns) {
            Ok(scraper) => scraper,
            Err(e) => {
                run_dir.remove_handle_if(&record)?;
                return Err(e);
            }
        };
        let spec = self.launch_spec(run_dir, &input, cores);
        let started_at = Utc::now();

        info!(
            "Starting {} job in {} on {} backend with {} core(s)",
            input.sim_type,
            run_dir.path().display(),
            backend,
            cores
        );

        let handle = match self.start(backend, &spec).await {
            Ok(handle) => handle,
            Err(e) => {
                error!("Failed to start job: {}", e);
                let output = JobOutput {
                    state: JobState::Error,
                    sim_type: input.sim_type.clone(),
                    backend,
                    exit_code: None,
                    error: Some(e.to_string()),
                    started_at,
                    completed_at: Utc::now(),
                };
                run_dir.remove_handle_if(&record)?;
                run_dir.write_output(&output)?;
                return Err(e);
            }
        };

        record.handle_id = handle.id();
        if let Err(e) = run_dir.write_handle(&record) {
            error!("Failed to record handle {}: {}", record.handle_id, e);
            handle.kill(Duration::ZERO).await?;
            handle.wait().await?;
            // Still holds this agent's claim
            if let Err(e) = run_dir.clear_handle() {
                warn!("Failed to clear handle record: {}", e);
            }
            return Err(e.into());
        }

        let timeout = input
            .timeout_secs
            .map(Duration::from_secs)
            .or(self.config.job_timeout);
        let (exit, kill_reason) = self.supervise(handle.as_ref(), timeout, &cancel).await;

        if let Err(e) = run_dir.clear_handle() {
            warn!("Failed to clear handle record: {}", e);
        }
        if let Err(e) = mpi::clear_sessions(run_dir.path()) {
            warn!("Failed to clear MPI sessions: {}", e);
        }

        let output = match exit {
            Ok(exit) => {
                let state = JobState::from_exit(exit, kill_reason);
                let error = match state {
                    JobState::Completed => None,
                    JobState::Error => {
                        let tail = run_dir.log_tail(self.config.log_scan_lines)?;
                        Some(scraper.describe_failure(&tail, exit.code()))
                    }
                    JobState::Canceled => Some("canceled".to_string()),
                    JobState::TimedOut => Some(match timeout {
                        Some(limit) => format!("timed out after {}s", limit.as_secs()),
                        None => "timed out".to_string(),
                    }),
                };
                JobOutput {
                    state,
                    sim_type: input.sim_type,
                    backend,
                    exit_code: exit.code(),
                    error,
                    started_at,
                    completed_at: Utc::now(),
                }
            }
            Err(e) => {
                error!("Lost job {}: {}", handle.id(), e);
                JobOutput {
                    state: JobState::Error,
                    sim_type: input.sim_type,
                    backend,
                    exit_code: None,
                    error: Some(e.to_string()),
                    started_at,
                    completed_at: Utc::now(),
                }
            }
        };

        run_dir.write_output(&output)?;
        info!(
            "Job in {} finished: {}",
            run_dir.path().display(),
            output.state
        );
        Ok(output)
    }

    async fn start(&self, backend: Backend, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>> {
        if backend == Backend::Docker {
            let version = self.docker.runtime().version().await?;
            debug!("Container runtime: {}", version);
        }
        self.launcher(backend).start(spec).await
    }

    /// Waits for exit, killing the job on cancellation or timeout
    async fn supervise(
        &self,
        handle: &dyn ProcessHandle,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> (Result<ExitState>, Option<KillReason>) {
        let deadline = async {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        let mut kill_reason = None;
        loop {
            let reason = tokio::select! {
                exit = handle.wait() => return (exit, kill_reason),
                _ = cancel.cancelled(), if kill_reason.is_none() => KillReason::Canceled,
                _ = &mut deadline, if kill_reason.is_none() => KillReason::TimedOut,
            };

            info!(
                "Killing job {} ({:?}), grace period {:?}",
                handle.id(),
                reason,
                self.config.kill_grace
            );
            kill_reason = Some(reason);
            if let Err(e) = handle.kill(self.config.kill_grace).await {
                error!("Failed to kill job {}: {}", handle.id(), e);
            }
        }
    }
}

/// Attempts at replacing a stale handle before giving up
const CLAIM_ATTEMPTS: usize = 3;

/// Takes ownership of `run_dir` before anything is started
///
/// The returned record has an empty `handle_id` until the job is started.
/// A record left by a dead agent is discarded; one owned by a live agent,
/// including another run in this process, makes the run fail.
fn claim(run_dir: &RunDir, backend: Backend) -> Result<HandleRecord> {
    let record = HandleRecord::new(backend, "", std::process::id());

    for _ in 0..CLAIM_ATTEMPTS {
        if run_dir.create_handle(&record)? {
            debug!("Claimed {}", run_dir.path().display());
            return Ok(record);
        }

        // Removed in between by its owner
        let Some(existing) = run_dir.read_handle()? else {
            continue;
        };

        if process_alive(existing.agent_pid) {
            return Err(RunnerError::Busy {
                agent_pid: existing.agent_pid,
            });
        }

        warn!(
            "Discarding stale handle {} of agent {}",
            existing.handle_id, existing.agent_pid
        );
        run_dir.remove_handle_if(&existing)?;
    }

    match run_dir.read_handle()? {
        Some(existing) => Err(RunnerError::Busy {
            agent_pid: existing.agent_pid,
        }),
        None => Err(RunnerError::Busy { agent_pid: 0 }),
    }
}

#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    // 0 and negative pids address process groups
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 only checks for existence and permission
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    false
}

/// Cancels `token` on Ctrl-C or SIGTERM
pub fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    return;
                }
            };

            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to install Ctrl-C handler: {}", e);
                return;
            }
            info!("Received Ctrl-C");
        }

        token.cancel();
    });
}
