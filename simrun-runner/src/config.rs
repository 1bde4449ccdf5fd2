//! Runner configuration
//!
//! Defines all configurable parameters of the job supervisor: the default
//! driver backend, MPI core count, kill grace period, job timeout and the
//! container settings used by the docker backend.

use simrun_core::domain::job::Backend;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::driver::DockerOptions;
use crate::error::{Result, RunnerError};

/// Runner configuration
///
/// Every value can be overridden from the environment so the same binary
/// works on a laptop (local processes, one core) and on a cluster node
/// (containers, many cores).
#[derive(Debug, Clone)]
pub struct Config {
    /// Backend used when the job does not name one
    pub backend: Backend,

    /// MPI ranks for background runs
    pub mpi_cores: usize,

    /// MPI launcher program
    pub mpiexec: String,

    /// Time between SIGTERM and SIGKILL when a job is cancelled
    pub kill_grace: Duration,

    /// Wall clock limit applied when the job does not set one
    pub job_timeout: Option<Duration>,

    /// Container runtime settings
    pub docker: DockerOptions,

    /// Bind-mount `dev_mounts` into containers
    pub dev_mode: bool,

    /// Host source directories visible to containers in dev mode
    pub dev_mounts: Vec<PathBuf>,

    /// Forwarded to jobs as PYENV_VERSION
    pub pyenv_version: Option<String>,

    /// Trailing lines of `run.log` searched for error banners
    pub log_scan_lines: usize,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new() -> Self {
        Self {
            backend: Backend::Local,
            mpi_cores: 1,
            mpiexec: "mpiexec".to_string(),
            kill_grace: Duration::from_secs(2),
            job_timeout: None,
            docker: DockerOptions::default(),
            dev_mode: false,
            dev_mounts: Vec::new(),
            pyenv_version: None,
            log_scan_lines: 500,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Recognized environment variables (all optional):
    /// - SIMRUN_BACKEND: local | docker (default: local)
    /// - SIMRUN_MPI_CORES, or SIREPO_MPI_CORES (default: 1)
    /// - SIMRUN_MPIEXEC (default: mpiexec)
    /// - SIMRUN_KILL_GRACE: seconds (default: 2)
    /// - SIMRUN_JOB_TIMEOUT: seconds (default: none)
    /// - SIMRUN_CONTAINER_RUNTIME: docker | podman (default: docker)
    /// - SIMRUN_IMAGE (default: radiasoft/beamsim:latest)
    /// - SIMRUN_DOCKER_USER: uid:gid (default: the supervisor's)
    /// - SIMRUN_DOCKER_NETWORK_HOST: bool (default: false)
    /// - SIMRUN_DOCKER_CPUS, SIMRUN_DOCKER_MEMORY
    /// - SIMRUN_DEV_MODE: bool, SIMRUN_DEV_MOUNTS: colon separated paths
    /// - PYENV_VERSION
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Config::from_env`] with variables supplied by `var`
    pub fn from_lookup<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| var(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::new();

        if let Some(backend) = var("SIMRUN_BACKEND") {
            config.backend = Backend::from_str(&backend).map_err(RunnerError::config)?;
        }
        if let Some(cores) = var("SIMRUN_MPI_CORES").or_else(|| var("SIREPO_MPI_CORES")) {
            config.mpi_cores = parse("SIMRUN_MPI_CORES", &cores)?;
        }
        if let Some(mpiexec) = var("SIMRUN_MPIEXEC") {
            config.mpiexec = mpiexec;
        }
        if let Some(grace) = var("SIMRUN_KILL_GRACE") {
            config.kill_grace = Duration::from_secs(parse("SIMRUN_KILL_GRACE", &grace)?);
        }
        if let Some(timeout) = var("SIMRUN_JOB_TIMEOUT") {
            config.job_timeout = Some(Duration::from_secs(parse("SIMRUN_JOB_TIMEOUT", &timeout)?));
        }
        if let Some(runtime) = var("SIMRUN_CONTAINER_RUNTIME") {
            config.docker.runtime = runtime;
        }
        if let Some(image) = var("SIMRUN_IMAGE") {
            config.docker.image = image;
        }
        if let Some(user) = var("SIMRUN_DOCKER_USER") {
            config.docker.user = Some(user);
        }
        if let Some(host) = var("SIMRUN_DOCKER_NETWORK_HOST") {
            config.docker.network_host = parse_bool("SIMRUN_DOCKER_NETWORK_HOST", &host)?;
        }
        if let Some(cpus) = var("SIMRUN_DOCKER_CPUS") {
            config.docker.cpus = Some(parse("SIMRUN_DOCKER_CPUS", &cpus)?);
        }
        if let Some(memory) = var("SIMRUN_DOCKER_MEMORY") {
            config.docker.memory = Some(memory);
        }
        if let Some(dev) = var("SIMRUN_DEV_MODE") {
            config.dev_mode = parse_bool("SIMRUN_DEV_MODE", &dev)?;
        }
        if let Some(mounts) = var("SIMRUN_DEV_MOUNTS") {
            config.dev_mounts = std::env::split_paths(&mounts).collect();
        }
        config.pyenv_version = var("PYENV_VERSION");

        Ok(config)
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_mpi_cores(mut self, cores: usize) -> Self {
        self.mpi_cores = cores;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    pub fn with_pyenv_version(mut self, version: impl Into<String>) -> Self {
        self.pyenv_version = Some(version.into());
        self
    }

    /// Container settings with dev-mode mounts applied
    pub fn docker_options(&self) -> DockerOptions {
        let mut options = self.docker.clone();
        if self.dev_mode {
            options.dev_mounts = self.dev_mounts.clone();
        }
        options
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.mpi_cores == 0 {
            return Err(RunnerError::config("mpi_cores must be greater than 0"));
        }

        if self.mpiexec.trim().is_empty() {
            return Err(RunnerError::config("mpiexec cannot be empty"));
        }

        if self.docker.runtime.trim().is_empty() {
            return Err(RunnerError::config("container runtime cannot be empty"));
        }

        if self.docker.image.trim().is_empty() {
            return Err(RunnerError::config("image cannot be empty"));
        }

        if self.job_timeout == Some(Duration::ZERO) {
            return Err(RunnerError::config("job_timeout must be greater than 0"));
        }

        if self.docker.cpus.is_some_and(|cpus| cpus <= 0.0) {
            return Err(RunnerError::config("docker cpus must be greater than 0"));
        }

        if self.dev_mode {
            if let Some(relative) = self.dev_mounts.iter().find(|m| !m.is_absolute()) {
                return Err(RunnerError::config(format!(
                    "dev mount {} must be an absolute path",
                    relative.display()
                )));
            }
        }

        if self.log_scan_lines == 0 {
            return Err(RunnerError::config("log_scan_lines must be greater than 0"));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| RunnerError::config(format!("{} has invalid value '{}'", key, value)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(RunnerError::config(format!(
            "{} has invalid boolean '{}'",
            key, value
        ))),
    }
}
