//! Job description DTO (`in.json`)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::job::Backend;

/// Job description written by the job runner into `in.json`
///
/// Only the fields the supervisor needs are modelled; simulation-specific
/// content of the file is ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInput {
    /// Simulator key, e.g. "elegant", "opal", "zgoubi"
    pub sim_type: String,

    /// Program followed by its arguments
    pub command: Vec<String>,

    /// Extra environment for the job
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// MPI cores for background runs; falls back to the configured count
    #[serde(default)]
    pub mpi_cores: Option<usize>,

    /// Backend override; falls back to the configured backend
    #[serde(default)]
    pub backend: Option<Backend>,

    /// Container image override
    #[serde(default)]
    pub image: Option<String>,

    /// Wall clock limit in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Regexes matching tool-specific error banners in `run.log`
    #[serde(default)]
    pub error_patterns: Vec<String>,
}

impl JobInput {
    pub fn validate(&self) -> Result<(), String> {
        if self.sim_type.trim().is_empty() {
            return Err("sim_type cannot be empty".to_string());
        }
        match self.command.first() {
            None => return Err("command cannot be empty".to_string()),
            Some(program) if program.trim().is_empty() => {
                return Err("command program cannot be empty".to_string());
            }
            Some(_) => {}
        }
        if self.mpi_cores == Some(0) {
            return Err("mpi_cores must be greater than 0".to_string());
        }
        if self.timeout_secs == Some(0) {
            return Err("timeout_secs must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Program to execute
    ///
    /// Only valid after `validate` succeeded.
    pub fn program(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or_default()
    }

    pub fn args(&self) -> &[String] {
        self.command.get(1..).unwrap_or_default()
    }
}
