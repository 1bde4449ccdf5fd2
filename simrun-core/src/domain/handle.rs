//! Handle record for a live job

use serde::{Deserialize, Serialize};

use crate::domain::job::Backend;

/// Identifies the OS resource backing a running job
///
/// Written into the run directory while the job is live so that a separate
/// process (the CLI) can find the supervising agent. One record per run
/// directory; removed when the job is reclaimed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleRecord {
    pub backend: Backend,
    /// OS pid for local jobs, container name for docker jobs
    pub handle_id: String,
    /// Pid of the agent supervising the job
    pub agent_pid: u32,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl HandleRecord {
    pub fn new(backend: Backend, handle_id: impl Into<String>, agent_pid: u32) -> Self {
        Self {
            backend,
            handle_id: handle_id.into(),
            agent_pid,
            started_at: chrono::Utc::now(),
        }
    }
}
