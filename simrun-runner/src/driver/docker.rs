//! Container backend
//!
//! Runs the job in a container driven through the runtime CLI (`docker` or
//! `podman`):
//! - the container name is derived from the run directory, so a container
//!   left behind by a crashed supervisor is found and removed before start
//! - the run directory is bind-mounted at the same path and used as workdir
//! - exit is awaited with `<runtime> wait`, output is copied into `run.log`
//!   with `<runtime> logs` once the container has stopped
//! - the container is removed exactly once, by the monitor task

use async_trait::async_trait;
use simrun_core::domain::job::{Backend, ExitState};
use simrun_core::domain::run_dir::LOG_FILE;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

use super::supervise::{Completion, CompletionSender, KillTimer, completion};
use super::{LaunchSpec, Launcher, ProcessHandle};
use crate::env;
use crate::error::{Result, RunnerError};

/// Exit code reported when the runtime could not tell how the container ended
const RUNTIME_FAILURE_EXIT: i32 = 125;

/// Container settings that do not vary per job
#[derive(Debug, Clone)]
pub struct DockerOptions {
    /// Runtime CLI, e.g. "docker" or "podman"
    pub runtime: String,
    /// Image used when the job does not name one
    pub image: String,
    /// `uid:gid` to run as; files in the run dir stay owned by the supervisor
    pub user: Option<String>,
    pub network_host: bool,
    pub cpus: Option<f64>,
    pub memory: Option<String>,
    /// Host directories bind-mounted read-only at the same path (dev mode)
    pub dev_mounts: Vec<PathBuf>,
}

impl Default for DockerOptions {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            image: "radiasoft/beamsim:latest".to_string(),
            user: current_user(),
            network_host: false,
            cpus: None,
            memory: None,
            dev_mounts: Vec::new(),
        }
    }
}

#[cfg(unix)]
fn current_user() -> Option<String> {
    // SAFETY: getuid/getgid cannot fail
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    Some(format!("{}:{}", uid, gid))
}

#[cfg(not(unix))]
fn current_user() -> Option<String> {
    None
}

/// Thin async wrapper over the container runtime CLI
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    program: String,
}

impl ContainerRuntime {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(args).stdin(Stdio::null());
        env::sanitize(&mut cmd);
        cmd
    }

    async fn output(&self, args: &[String]) -> Result<Output> {
        self.command(args)
            .output()
            .await
            .map_err(|source| RunnerError::Spawn {
                program: self.program.clone(),
                source,
            })
    }

    /// Runs a runtime subcommand, failing on a non-zero exit
    async fn check(&self, args: &[String]) -> Result<String> {
        let output = self.output(args).await?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() {
            return Err(RunnerError::Runtime {
                command: format!("{} {}", self.program, args.join(" ")),
                code: output.status.code(),
                stderr,
            });
        }
        if !stderr.is_empty() {
            debug!("{} {}: {}", self.program, args[0], stderr);
        }
        Ok(stdout)
    }

    /// Checks that the runtime CLI answers
    pub async fn version(&self) -> Result<String> {
        self.check(&["--version".to_string()]).await
    }

    pub async fn run_detached(&self, args: &[String]) -> Result<String> {
        self.check(args).await
    }

    /// Blocks until the container stops and returns its exit code
    pub async fn wait(&self, name: &str) -> Result<i32> {
        let stdout = self.check(&["wait".to_string(), name.to_string()]).await?;
        stdout
            .lines()
            .last()
            .and_then(|line| line.trim().parse().ok())
            .ok_or_else(|| RunnerError::Runtime {
                command: format!("{} wait {}", self.program, name),
                code: None,
                stderr: format!("unexpected output '{}'", stdout),
            })
    }

    /// Sends `signal` to the container (SIGKILL when `None`)
    pub async fn kill(&self, name: &str, signal: Option<&str>) -> Result<()> {
        let mut args = vec!["kill".to_string()];
        if let Some(signal) = signal {
            args.push("--signal".to_string());
            args.push(signal.to_string());
        }
        args.push(name.to_string());
        self.check(&args).await.map(|_| ())
    }

    /// Force-removes the container; a missing container is not an error
    pub async fn remove(&self, name: &str) -> Result<bool> {
        let output = self
            .output(&["rm".to_string(), "-f".to_string(), name.to_string()])
            .await?;
        Ok(output.status.success())
    }

    /// Appends the container's stdout and stderr to `log_path`
    pub async fn copy_logs(&self, name: &str, log_path: &Path) -> Result<()> {
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        let status = self
            .command(&["logs".to_string(), name.to_string()])
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .status()
            .await
            .map_err(|source| RunnerError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        if !status.success() {
            return Err(RunnerError::Runtime {
                command: format!("{} logs {}", self.program, name),
                code: status.code(),
                stderr: String::new(),
            });
        }
        Ok(())
    }
}

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a; names must stay the same across builds of the supervisor
fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, &byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Deterministic container name for a run directory
pub fn container_name(run_dir: &Path) -> String {
    let hash = fnv1a(run_dir.as_os_str().as_encoded_bytes());
    format!("simrun-{:016x}", hash)
}

/// Arguments for `<runtime> run` starting the job detached
pub fn run_args(name: &str, spec: &LaunchSpec, options: &DockerOptions) -> Vec<String> {
    let run_dir = spec.run_dir.to_string_lossy();
    let mut args: Vec<String> = vec![
        "run".into(),
        "--detach".into(),
        "--init".into(),
        "--name".into(),
        name.into(),
        "--volume".into(),
        format!("{}:{}", run_dir, run_dir),
        "--workdir".into(),
        run_dir.to_string(),
    ];

    if let Some(user) = &options.user {
        args.push("--user".into());
        args.push(user.clone());
    }
    if options.network_host {
        args.push("--network=host".into());
    }
    if let Some(cpus) = options.cpus {
        args.push(format!("--cpus={}", cpus));
    }
    if let Some(memory) = &options.memory {
        args.push(format!("--memory={}", memory));
    }
    for mount in &options.dev_mounts {
        let mount = mount.to_string_lossy();
        args.push("--volume".into());
        args.push(format!("{}:{}:ro", mount, mount));
    }
    for (key, value) in &spec.env {
        args.push("--env".into());
        args.push(format!("{}={}", key, value));
    }

    args.push(spec.image.clone().unwrap_or_else(|| options.image.clone()));
    args.push(spec.program.clone());
    args.extend(spec.args.iter().cloned());
    args
}

/// Launches jobs as containers
#[derive(Debug, Clone)]
pub struct DockerLauncher {
    runtime: ContainerRuntime,
    options: DockerOptions,
}

impl DockerLauncher {
    pub fn new(options: DockerOptions) -> Self {
        Self {
            runtime: ContainerRuntime::new(options.runtime.clone()),
            options,
        }
    }

    pub fn runtime(&self) -> &ContainerRuntime {
        &self.runtime
    }
}

#[async_trait]
impl Launcher for DockerLauncher {
    fn backend(&self) -> Backend {
        Backend::Docker
    }

    async fn start(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>> {
        let name = container_name(&spec.run_dir);

        // Stale container from a previous supervisor of this run dir
        if self.runtime.remove(&name).await? {
            debug!("Removed stale container {}", name);
        }

        let args = run_args(&name, spec, &self.options);
        info!("Starting container {}: {}", name, spec.command_line());
        let container_id = self.runtime.run_detached(&args).await?;
        info!("Container {} started with ID: {}", name, container_id);

        let (tx, completion) = completion(name.clone());
        let timer = Arc::new(KillTimer::new());
        let terminated = Arc::new(Mutex::new(false));
        let (force_tx, force_rx) = mpsc::unbounded_channel();

        tokio::spawn(monitor(
            self.runtime.clone(),
            name.clone(),
            spec.run_dir.join(LOG_FILE),
            force_rx,
            tx,
            Arc::clone(&timer),
            Arc::clone(&terminated),
        ));

        Ok(Box::new(DockerProcess {
            name,
            runtime: self.runtime.clone(),
            completion,
            timer,
            terminated,
            force_tx,
        }))
    }
}

/// A job running as a container
pub struct DockerProcess {
    name: String,
    runtime: ContainerRuntime,
    completion: Completion,
    timer: Arc<KillTimer>,
    /// Set once a signal reached the running container; held while signalling
    terminated: Arc<Mutex<bool>>,
    force_tx: mpsc::UnboundedSender<()>,
}

#[async_trait]
impl ProcessHandle for DockerProcess {
    fn id(&self) -> String {
        self.name.clone()
    }

    fn status(&self) -> ExitState {
        self.completion.peek()
    }

    async fn wait(&self) -> Result<ExitState> {
        self.completion.wait().await
    }

    async fn kill(&self, grace: Duration) -> Result<()> {
        let mut terminated = self.terminated.lock().await;
        if self.completion.is_done() {
            debug!("Container {} already exited, ignoring kill", self.name);
            return Ok(());
        }

        info!("Terminating container {} (grace {:?})", self.name, grace);
        match self.runtime.kill(&self.name, Some("TERM")).await {
            Ok(()) => *terminated = true,
            // The runtime refuses to signal a container that has stopped
            Err(e) => warn!("Failed to send SIGTERM to container {}: {}", self.name, e),
        }
        drop(terminated);

        let force_tx = self.force_tx.clone();
        self.timer.arm(grace, async move {
            let _ = force_tx.send(());
        });
        Ok(())
    }
}

async fn monitor(
    runtime: ContainerRuntime,
    name: String,
    log_path: PathBuf,
    mut force_rx: mpsc::UnboundedReceiver<()>,
    tx: CompletionSender,
    timer: Arc<KillTimer>,
    terminated: Arc<Mutex<bool>>,
) {
    let exit = tokio::select! {
        exit = runtime.wait(&name) => exit,
        // Either the grace period ran out or the handle was dropped
        _ = force_rx.recv() => {
            warn!("Container {} still running, killing", name);
            match runtime.kill(&name, None).await {
                Ok(()) => *terminated.lock().await = true,
                Err(e) => debug!("Forced kill of container {} failed: {}", name, e),
            }
            runtime.wait(&name).await
        }
    };
    timer.close();
    // Waits for a kill that is still signalling
    let killed = *terminated.lock().await;

    if let Err(e) = runtime.copy_logs(&name, &log_path).await {
        warn!("Failed to collect logs of container {}: {}", name, e);
    }
    match runtime.remove(&name).await {
        Ok(true) => debug!("Container {} removed", name),
        Ok(false) => warn!("Container {} could not be removed", name),
        Err(e) => warn!("Failed to remove container {}: {}", name, e),
    }

    let state = if killed {
        ExitState::Killed
    } else {
        match exit {
            Ok(code) => ExitState::Exited(code),
            Err(e) => {
                error!("Failed to wait for container {}: {}", name, e);
                ExitState::Exited(RUNTIME_FAILURE_EXIT)
            }
        }
    };

    info!("Container {} finished: {}", name, state);
    tx.complete(state);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> DockerOptions {
        DockerOptions {
            runtime: "podman".to_string(),
            image: "radiasoft/beamsim:latest".to_string(),
            user: Some("1000:1000".to_string()),
            network_host: false,
            cpus: None,
            memory: None,
            dev_mounts: Vec::new(),
        }
    }

    #[test]
    fn test_container_name_is_deterministic() {
        let a = container_name(Path::new("/srv/run/abc"));
        let b = container_name(Path::new("/srv/run/abc"));
        let c = container_name(Path::new("/srv/run/def"));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("simrun-"));
        assert_eq!(a.len(), "simrun-".len() + 16);
    }

    #[test]
    fn test_container_name_is_stable_across_builds() {
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a(b"foobar"), 0x8594_4171_f739_67e8);
        assert_eq!(
            container_name(Path::new("foobar")),
            "simrun-85944171f73967e8"
        );
    }

    #[test]
    fn test_run_args_basic() {
        let spec = LaunchSpec::new("/srv/run/abc", "zgoubi").with_args(["zgoubi.dat"]);
        let args = run_args("simrun-1", &spec, &options());

        assert_eq!(
            args,
            vec![
                "run",
                "--detach",
                "--init",
                "--name",
                "simrun-1",
                "--volume",
                "/srv/run/abc:/srv/run/abc",
                "--workdir",
                "/srv/run/abc",
                "--user",
                "1000:1000",
                "radiasoft/beamsim:latest",
                "zgoubi",
                "zgoubi.dat",
            ]
        );
    }

    #[test]
    fn test_run_args_with_limits_env_and_dev_mounts() {
        let mut options = options();
        options.user = None;
        options.network_host = true;
        options.cpus = Some(2.0);
        options.memory = Some("4g".to_string());
        options.dev_mounts = vec![PathBuf::from("/home/dev/src")];

        let spec = LaunchSpec::new("/srv/run/abc", "mpiexec")
            .with_args(["-n", "2", "opal", "opal.in"])
            .with_env("SIMRUN_MPI_CORES", "2")
            .with_image("radiasoft/opal:dev");
        let args = run_args("simrun-2", &spec, &options);

        assert!(!args.contains(&"--user".to_string()));
        assert!(args.contains(&"--network=host".to_string()));
        assert!(args.contains(&"--cpus=2".to_string()));
        assert!(args.contains(&"--memory=4g".to_string()));
        assert!(args.contains(&"/home/dev/src:/home/dev/src:ro".to_string()));
        assert!(args.contains(&"SIMRUN_MPI_CORES=2".to_string()));

        let image_pos = args.iter().position(|a| a == "radiasoft/opal:dev").unwrap();
        assert_eq!(
            &args[image_pos + 1..],
            &["mpiexec", "-n", "2", "opal", "opal.in"]
        );
    }

    #[tokio::test]
    async fn test_missing_runtime_is_spawn_error() {
        let runtime = ContainerRuntime::new("/nonexistent/simrun-docker");
        let err = runtime.version().await.unwrap_err();
        assert!(matches!(err, RunnerError::Spawn { .. }));
    }
}
