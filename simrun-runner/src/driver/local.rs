//! Local process backend
//!
//! Runs the job as a child process of the supervisor:
//! - cwd is the run directory, stdout and stderr are appended to `run.log`
//! - the child leads its own process group so signals reach `mpiexec` ranks
//! - a monitor task owns the child, resolves the completion signal and
//!   closes the kill timer when the child exits

use async_trait::async_trait;
use simrun_core::domain::job::{Backend, ExitState};
use simrun_core::domain::run_dir::LOG_FILE;
use std::fs::OpenOptions;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::supervise::{Completion, CompletionSender, KillTimer, completion};
use super::{LaunchSpec, Launcher, ProcessHandle};
use crate::env;
use crate::error::{Result, RunnerError};

/// Launches jobs as local child processes
#[derive(Debug, Clone, Default)]
pub struct LocalLauncher {}

impl LocalLauncher {
    pub fn new() -> Self {
        Self {}
    }
}

#[async_trait]
impl Launcher for LocalLauncher {
    fn backend(&self) -> Backend {
        Backend::Local
    }

    async fn start(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>> {
        let process = LocalProcess::spawn(spec)?;
        Ok(Box::new(process))
    }
}

/// Requests sent from the handle to the monitor
#[derive(Debug, Clone, Copy)]
enum Control {
    Terminate,
    Force,
}

/// A job running as a local child process
pub struct LocalProcess {
    pid: u32,
    completion: Completion,
    timer: Arc<KillTimer>,
    /// Kill requests for the monitor; dropping it force-kills the job
    control_tx: mpsc::UnboundedSender<Control>,
}

impl LocalProcess {
    pub fn spawn(spec: &LaunchSpec) -> Result<Self> {
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(spec.run_dir.join(LOG_FILE))?;

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.run_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log));
        env::sanitize(&mut cmd);
        cmd.envs(&spec.env);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            program: spec.program.clone(),
            source,
        })?;
        let pid = child
            .id()
            .ok_or_else(|| RunnerError::MonitorLost(spec.program.clone()))?;

        info!("Started process {}: {}", pid, spec.command_line());

        let (tx, completion) = completion(pid.to_string());
        let timer = Arc::new(KillTimer::new());
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        tokio::spawn(monitor(child, pid, control_rx, tx, Arc::clone(&timer)));

        Ok(Self {
            pid,
            completion,
            timer,
            control_tx,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

#[async_trait]
impl ProcessHandle for LocalProcess {
    fn id(&self) -> String {
        self.pid.to_string()
    }

    fn status(&self) -> ExitState {
        self.completion.peek()
    }

    async fn wait(&self) -> Result<ExitState> {
        self.completion.wait().await
    }

    async fn kill(&self, grace: Duration) -> Result<()> {
        if self.completion.is_done() {
            debug!("Process {} already exited, ignoring kill", self.pid);
            return Ok(());
        }

        info!("Terminating process {} (grace {:?})", self.pid, grace);
        if self.control_tx.send(Control::Terminate).is_err() {
            debug!("Monitor of process {} already finished", self.pid);
            return Ok(());
        }

        let control_tx = self.control_tx.clone();
        self.timer.arm(grace, async move {
            let _ = control_tx.send(Control::Force);
        });
        Ok(())
    }
}

/// Owns the child until it exits and reports the exit exactly once
///
/// Signals are sent from here so that a child which already exited is never
/// reported as killed.
async fn monitor(
    mut child: Child,
    pid: u32,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
    tx: CompletionSender,
    timer: Arc<KillTimer>,
) {
    let mut killed = false;
    let status = loop {
        let request = tokio::select! {
            biased;
            status = child.wait() => break status,
            request = control_rx.recv() => request,
        };

        match child.try_wait() {
            Ok(Some(status)) => break Ok(status),
            Ok(None) => {}
            Err(e) => break Err(e),
        }

        killed = true;
        match request {
            Some(Control::Terminate) => {
                if let Err(e) = signal::terminate(pid) {
                    warn!("Failed to send SIGTERM to process {}: {}", pid, e);
                }
            }
            // None: handle dropped while the job was still running
            Some(Control::Force) | None => {
                warn!("Process {} still running, killing", pid);
                if let Err(e) = signal::kill(pid) {
                    debug!("SIGKILL to process group {} failed: {}", pid, e);
                }
                let _ = child.start_kill();
                break child.wait().await;
            }
        }
    };
    timer.close();

    let state = if killed {
        ExitState::Killed
    } else {
        match status {
            Ok(status) => exit_state(status),
            Err(e) => {
                warn!("Failed to wait for process {}: {}", pid, e);
                ExitState::Exited(-1)
            }
        }
    };

    info!("Process {} finished: {}", pid, state);
    tx.complete(state);
}

/// Converts an OS exit status; signal deaths map to `128 + signal`
fn exit_state(status: ExitStatus) -> ExitState {
    if let Some(code) = status.code() {
        return ExitState::Exited(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return ExitState::Exited(128 + sig);
        }
    }
    ExitState::Exited(-1)
}

#[cfg(unix)]
mod signal {
    use std::io;

    fn send(pid: u32, sig: libc::c_int) -> io::Result<()> {
        let pid = libc::pid_t::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        // Negative pid addresses the whole process group led by the child
        let rc = unsafe { libc::kill(-pid, sig) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(err)
    }

    pub fn terminate(pid: u32) -> io::Result<()> {
        send(pid, libc::SIGTERM)
    }

    pub fn kill(pid: u32) -> io::Result<()> {
        send(pid, libc::SIGKILL)
    }
}

#[cfg(not(unix))]
mod signal {
    use std::io;

    // No graceful signal available; the monitor's start_kill does the work
    pub fn terminate(_pid: u32) -> io::Result<()> {
        Ok(())
    }

    pub fn kill(_pid: u32) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn shell(dir: &std::path::Path, script: &str) -> LaunchSpec {
        LaunchSpec::new(dir, "sh").with_args(["-c", script])
    }

    #[tokio::test]
    async fn test_exit_code_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let process = LocalProcess::spawn(&shell(tmp.path(), "exit 3")).unwrap();

        assert_eq!(process.wait().await.unwrap(), ExitState::Exited(3));
        assert_eq!(process.status(), ExitState::Exited(3));
    }

    #[tokio::test]
    async fn test_output_captured_in_run_log() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = shell(tmp.path(), "echo hello; echo oops >&2; echo $SIMRUN_TEST_VAR")
            .with_env("SIMRUN_TEST_VAR", "from-launch");
        let process = LocalProcess::spawn(&spec).unwrap();

        assert!(process.wait().await.unwrap().success());

        let log = std::fs::read_to_string(tmp.path().join(LOG_FILE)).unwrap();
        assert!(log.contains("hello"));
        assert!(log.contains("oops"));
        assert!(log.contains("from-launch"));
    }

    #[tokio::test]
    async fn test_runs_in_run_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let process = LocalProcess::spawn(&shell(tmp.path(), "touch marker")).unwrap();

        process.wait().await.unwrap();
        assert!(tmp.path().join("marker").exists());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = LaunchSpec::new(tmp.path(), "/nonexistent/simrun-program");
        let err = LocalProcess::spawn(&spec).err().unwrap();
        assert!(matches!(err, RunnerError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_kill_during_wait_reports_killed() {
        let tmp = tempfile::tempdir().unwrap();
        let process = Arc::new(LocalProcess::spawn(&shell(tmp.path(), "sleep 30")).unwrap());

        let waiter = tokio::spawn({
            let process = Arc::clone(&process);
            async move { process.wait().await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        process.kill(Duration::from_secs(5)).await.unwrap();

        let state = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(state, ExitState::Killed);
    }

    #[tokio::test]
    async fn test_kill_escalates_after_grace() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = shell(tmp.path(), "trap '' TERM; echo ready; while true; do sleep 1; done");
        let process = LocalProcess::spawn(&spec).unwrap();

        // Wait until the trap is installed
        let log = tmp.path().join(LOG_FILE);
        for _ in 0..50 {
            if std::fs::read_to_string(&log).unwrap_or_default().contains("ready") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let started = Instant::now();
        process.kill(Duration::from_millis(300)).await.unwrap();
        let state = tokio::time::timeout(Duration::from_secs(5), process.wait())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(state, ExitState::Killed);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_kill_after_exit_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let process = LocalProcess::spawn(&shell(tmp.path(), "exit 0")).unwrap();

        assert_eq!(process.wait().await.unwrap(), ExitState::Exited(0));
        process.kill(Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(process.status(), ExitState::Exited(0));
    }

    #[tokio::test]
    async fn test_kill_racing_clean_exit_keeps_exit_code() {
        let tmp = tempfile::tempdir().unwrap();
        let process = LocalProcess::spawn(&shell(tmp.path(), "exit 0")).unwrap();

        // Block the runtime so the monitor has not observed the exit yet
        std::thread::sleep(Duration::from_millis(300));
        assert!(!process.completion.is_done());

        process.kill(Duration::from_millis(10)).await.unwrap();
        assert_eq!(process.wait().await.unwrap(), ExitState::Exited(0));
    }

    #[tokio::test]
    async fn test_inherited_mpi_variables_are_not_passed_on() {
        let tmp = tempfile::tempdir().unwrap();
        // SAFETY: the variable name is unique to this test
        unsafe {
            std::env::set_var("PMIX_SIMRUN_LOCAL_MARKER", "leaked");
            std::env::set_var("OMPI_SIMRUN_LOCAL_MARKER", "leaked");
        }
        let spec = LaunchSpec::new(tmp.path(), "env").with_env("SIMRUN_MPI_CORES", "1");
        let state = LocalProcess::spawn(&spec).unwrap().wait().await;
        unsafe {
            std::env::remove_var("PMIX_SIMRUN_LOCAL_MARKER");
            std::env::remove_var("OMPI_SIMRUN_LOCAL_MARKER");
        }

        assert_eq!(state.unwrap(), ExitState::Exited(0));
        let log = std::fs::read_to_string(tmp.path().join(LOG_FILE)).unwrap();
        assert!(log.contains("SIMRUN_MPI_CORES=1"));
        assert!(!log.contains("SIMRUN_LOCAL_MARKER"));
    }

    #[tokio::test]
    async fn test_signal_death_maps_to_exit_code() {
        let tmp = tempfile::tempdir().unwrap();
        let process = LocalProcess::spawn(&shell(tmp.path(), "kill -9 $$")).unwrap();
        assert_eq!(process.wait().await.unwrap(), ExitState::Exited(137));
    }

    #[tokio::test]
    async fn test_dropping_handle_kills_process() {
        let tmp = tempfile::tempdir().unwrap();
        let process = LocalProcess::spawn(&shell(tmp.path(), "sleep 30")).unwrap();
        let completion = process.completion.clone();

        drop(process);

        let state = tokio::time::timeout(Duration::from_secs(5), completion.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, ExitState::Killed);
    }
}
