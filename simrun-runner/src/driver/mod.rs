//! Driver backends
//!
//! A driver starts a job's program and hands back a [`ProcessHandle`]:
//! - `wait()` suspends until exit and reports the [`ExitState`]
//! - `kill(grace)` asks the job to terminate and escalates to a forced kill
//!   if it is still alive once `grace` has elapsed
//!
//! Two backends exist: [`local::LocalLauncher`] runs a child process and
//! [`docker::DockerLauncher`] runs a container through the runtime CLI.

pub mod docker;
pub mod local;
pub mod supervise;

use async_trait::async_trait;
use simrun_core::domain::job::{Backend, ExitState};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;

pub use docker::{DockerLauncher, DockerOptions};
pub use local::LocalLauncher;

/// Everything a backend needs to start a job
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Working directory; receives `run.log`
    pub run_dir: PathBuf,
    pub program: String,
    pub args: Vec<String>,
    /// Environment added on top of the sanitized inherited environment
    pub env: BTreeMap<String, String>,
    /// Container image; ignored by the local backend
    pub image: Option<String>,
}

impl LaunchSpec {
    pub fn new(run_dir: impl Into<PathBuf>, program: impl Into<String>) -> Self {
        Self {
            run_dir: run_dir.into(),
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            image: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Program and arguments as one line, for logging
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Starts jobs on one backend
#[async_trait]
pub trait Launcher: Send + Sync {
    fn backend(&self) -> Backend;

    /// Starts the job described by `spec`
    ///
    /// The returned handle owns the OS resources of the job. Dropping it
    /// while the job is running forces termination.
    async fn start(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>>;
}

/// A started job
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// OS pid or container name
    fn id(&self) -> String;

    /// Exit state without waiting
    fn status(&self) -> ExitState;

    /// Suspends until the job exits
    ///
    /// Safe to call concurrently and after exit.
    async fn wait(&self) -> Result<ExitState>;

    /// Requests termination, escalating to a forced kill after `grace`
    ///
    /// Each call replaces the pending forced kill of a previous call.
    /// Does nothing once the job has exited.
    async fn kill(&self, grace: Duration) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_spec_builder() {
        let spec = LaunchSpec::new("/tmp/run", "elegant")
            .with_args(["run.ele", "-rpnDefns=defns.rpn"])
            .with_env("SIMRUN_MPI_CORES", "1")
            .with_image("radiasoft/beamsim");

        assert_eq!(spec.command_line(), "elegant run.ele -rpnDefns=defns.rpn");
        assert_eq!(spec.env.get("SIMRUN_MPI_CORES").map(String::as_str), Some("1"));
        assert_eq!(spec.image.as_deref(), Some("radiasoft/beamsim"));
    }
}
