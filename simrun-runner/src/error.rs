//! Error types for the simrun runner

use simrun_core::RunDirError;
use std::io;
use thiserror::Error;

use crate::mpi::MpiError;

/// Result type alias for runner operations
pub type Result<T> = std::result::Result<T, RunnerError>;

/// Errors raised while supervising a job
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The job's program could not be started
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The container runtime CLI returned an error
    #[error("'{command}' failed (exit code {code:?}): {stderr}")]
    Runtime {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    /// The task watching a process went away without reporting an exit
    #[error("lost track of process {0}")]
    MonitorLost(String),

    /// Another live agent already owns the run directory
    #[error("run directory is owned by running agent {agent_pid}")]
    Busy { agent_pid: u32 },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid error pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error(transparent)]
    RunDir(#[from] RunDirError),

    #[error(transparent)]
    Mpi(#[from] MpiError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl RunnerError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
