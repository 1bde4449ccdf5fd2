//! Job environment
//!
//! A supervisor may itself run under an MPI launcher. Its `OMPI_*`, `PMIX_*`
//! and `PMI_*` variables describe that outer job and make a nested `mpiexec`
//! misbehave, so they are stripped before any subprocess is launched.

use std::collections::{BTreeMap, HashMap};
use tokio::process::Command;

use crate::config::Config;

/// Exported to every job with the effective core count
pub const MPI_CORES_VAR: &str = "SIMRUN_MPI_CORES";
pub const PYENV_VERSION_VAR: &str = "PYENV_VERSION";

const MPI_RUNTIME_PREFIXES: &[&str] = &["OMPI_", "PMIX_", "PMI_"];

/// Returns true for variables owned by an MPI runtime
pub fn is_mpi_runtime_var(key: &str) -> bool {
    MPI_RUNTIME_PREFIXES
        .iter()
        .any(|prefix| key.starts_with(prefix))
}

/// Removes inherited MPI runtime variables from `cmd`
pub fn sanitize(cmd: &mut Command) {
    for (key, _) in std::env::vars_os() {
        if key.to_str().is_some_and(is_mpi_runtime_var) {
            cmd.env_remove(&key);
        }
    }
}

/// Builds the environment a job runs with
///
/// Job-provided variables win over the supervisor's, except for MPI runtime
/// variables which are never forwarded.
pub fn job_env(
    config: &Config,
    cores: usize,
    job: &HashMap<String, String>,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert(MPI_CORES_VAR.to_string(), cores.to_string());
    if let Some(version) = &config.pyenv_version {
        env.insert(PYENV_VERSION_VAR.to_string(), version.clone());
    }
    for (key, value) in job {
        if is_mpi_runtime_var(key) {
            tracing::warn!("Ignoring MPI runtime variable {} from job environment", key);
            continue;
        }
        env.insert(key.clone(), value.clone());
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_mpi_runtime_var() {
        assert!(is_mpi_runtime_var("OMPI_COMM_WORLD_RANK"));
        assert!(is_mpi_runtime_var("PMIX_NAMESPACE"));
        assert!(is_mpi_runtime_var("PMI_RANK"));
        assert!(!is_mpi_runtime_var("PATH"));
        assert!(!is_mpi_runtime_var("SIMRUN_MPI_CORES"));
        assert!(!is_mpi_runtime_var("XOMPI_FOO"));
    }

    #[test]
    fn test_job_env() {
        let config = Config::default().with_pyenv_version("py3");
        let job = HashMap::from([
            ("OMP_NUM_THREADS".to_string(), "1".to_string()),
            ("OMPI_MCA_btl".to_string(), "self".to_string()),
        ]);

        let env = job_env(&config, 4, &job);

        assert_eq!(env.get(MPI_CORES_VAR).map(String::as_str), Some("4"));
        assert_eq!(env.get(PYENV_VERSION_VAR).map(String::as_str), Some("py3"));
        assert_eq!(env.get("OMP_NUM_THREADS").map(String::as_str), Some("1"));
        assert!(!env.contains_key("OMPI_MCA_btl"));
    }

    #[test]
    fn test_job_env_without_pyenv() {
        let config = Config::default();
        let env = job_env(&config, 1, &HashMap::new());
        assert_eq!(env.len(), 1);
        assert!(!env.contains_key(PYENV_VERSION_VAR));
    }
}
