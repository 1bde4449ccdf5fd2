//! Job domain types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Driver backend used to execute a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Child process on the supervisor's host
    #[default]
    Local,
    /// Container driven through the container runtime CLI
    Docker,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Local => write!(f, "local"),
            Backend::Docker => write!(f, "docker"),
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(Backend::Local),
            "docker" => Ok(Backend::Docker),
            other => Err(format!("unknown backend '{}'", other)),
        }
    }
}

/// Exit state of a supervised process or container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "code", rename_all = "lowercase")]
pub enum ExitState {
    Running,
    Exited(i32),
    Killed,
}

impl ExitState {
    /// Returns true once the process is no longer running
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExitState::Running)
    }

    /// Returns true for a zero exit code
    pub fn success(&self) -> bool {
        matches!(self, ExitState::Exited(0))
    }

    /// Exit code, if the process exited on its own
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitState::Exited(code) => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for ExitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitState::Running => write!(f, "running"),
            ExitState::Exited(code) => write!(f, "exited({})", code),
            ExitState::Killed => write!(f, "killed"),
        }
    }
}

/// Final state of a job as reported in `out.json`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Completed,
    Error,
    Canceled,
    TimedOut,
}

/// Why the supervisor asked a job to terminate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    Canceled,
    TimedOut,
}

impl JobState {
    /// Maps a process exit to the job state reported to the caller
    pub fn from_exit(exit: ExitState, kill_reason: Option<KillReason>) -> Self {
        match (exit, kill_reason) {
            (ExitState::Killed, Some(KillReason::TimedOut)) => JobState::TimedOut,
            (ExitState::Killed, _) => JobState::Canceled,
            (ExitState::Exited(0), _) => JobState::Completed,
            _ => JobState::Error,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Completed => "completed",
            JobState::Error => "error",
            JobState::Canceled => "canceled",
            JobState::TimedOut => "timedout",
        };
        write!(f, "{}", s)
    }
}

/// Result of a job, written once to `out.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutput {
    pub state: JobState,
    pub sim_type: String,
    pub backend: Backend,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: chrono::DateTime<chrono::Utc>,
}

impl JobOutput {
    pub fn is_success(&self) -> bool {
        self.state == JobState::Completed
    }

    /// Process exit status to mirror for a CLI wrapper
    pub fn process_exit_code(&self) -> i32 {
        match self.state {
            JobState::Completed => 0,
            JobState::Error => match self.exit_code {
                Some(code) if code != 0 => code,
                _ => 1,
            },
            JobState::Canceled => 130,
            // Standard timeout exit code
            JobState::TimedOut => 124,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(state: JobState, exit_code: Option<i32>) -> JobOutput {
        JobOutput {
            state,
            sim_type: "elegant".to_string(),
            backend: Backend::Local,
            exit_code,
            error: None,
            started_at: chrono::Utc::now(),
            completed_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_job_state_from_exit() {
        assert_eq!(JobState::from_exit(ExitState::Exited(0), None), JobState::Completed);
        assert_eq!(JobState::from_exit(ExitState::Exited(2), None), JobState::Error);
        assert_eq!(
            JobState::from_exit(ExitState::Killed, Some(KillReason::Canceled)),
            JobState::Canceled
        );
        assert_eq!(
            JobState::from_exit(ExitState::Killed, Some(KillReason::TimedOut)),
            JobState::TimedOut
        );
        // A job that exits cleanly while a cancel is in flight still completed
        assert_eq!(
            JobState::from_exit(ExitState::Exited(0), Some(KillReason::Canceled)),
            JobState::Completed
        );
    }

    #[test]
    fn test_exit_state_serialization() {
        let json = serde_json::to_value(ExitState::Exited(3)).unwrap();
        assert_eq!(json, serde_json::json!({"state": "exited", "code": 3}));

        let killed: ExitState = serde_json::from_value(serde_json::json!({"state": "killed"})).unwrap();
        assert_eq!(killed, ExitState::Killed);
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!("docker".parse::<Backend>().unwrap(), Backend::Docker);
        assert_eq!(" Local ".parse::<Backend>().unwrap(), Backend::Local);
        assert!("k8s".parse::<Backend>().is_err());
    }

    #[test]
    fn test_process_exit_code() {
        assert_eq!(output(JobState::Completed, Some(0)).process_exit_code(), 0);
        assert_eq!(output(JobState::Error, Some(7)).process_exit_code(), 7);
        assert_eq!(output(JobState::Error, None).process_exit_code(), 1);
        assert_eq!(output(JobState::TimedOut, None).process_exit_code(), 124);
        assert_eq!(output(JobState::Canceled, None).process_exit_code(), 130);
    }
}
