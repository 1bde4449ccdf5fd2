//! MPI support
//!
//! - [`MpiCommand`] wraps a program in an `mpiexec` invocation
//! - [`first_rank_op`] elects rank 0 to perform a single-writer side effect
//!   and broadcasts its outcome to all other ranks
//! - [`Communicator`] implementations: [`SingleRank`], [`LocalGroup`] for
//!   in-process ranks and [`FileCommunicator`] for ranks started by `mpiexec`

mod command;
mod comm;
mod file;

pub use comm::{Communicator, LocalGroup, SingleRank};
pub use command::MpiCommand;
pub use file::{FileCommunicator, SESSION_DIR, clear_sessions};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, error};

/// Rank elected for single-writer operations
pub const ROOT: usize = 0;

/// Exit code used when a rank aborts the communicator
pub const ABORT_EXIT_CODE: i32 = 1;

#[derive(Debug, Error)]
pub enum MpiError {
    /// The elected rank's operation failed
    #[error("first rank failed: {0}")]
    RootFailed(String),

    #[error("communicator aborted with code {0}")]
    Aborted(i32),

    #[error("timed out waiting for broadcast {seq} from rank {root}")]
    Timeout { root: usize, seq: u64 },

    #[error("rank {rank} must provide the broadcast payload")]
    MissingPayload { rank: usize },

    #[error("invalid rank environment: {0}")]
    Environment(String),

    #[error("broadcast payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What the elected rank broadcasts
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "value", rename_all = "lowercase")]
enum Outcome<T> {
    Ok(T),
    Failed(String),
}

/// Runs `op` on rank 0 only and hands its result to every rank
///
/// If the operation fails, or its outcome cannot be delivered, every rank
/// gets an error and the communicator is aborted so no other rank goes on to
/// produce partial output.
pub async fn first_rank_op<C, T, E, F, Fut>(comm: &C, op: F) -> Result<T, MpiError>
where
    C: Communicator + ?Sized,
    T: Serialize + DeserializeOwned,
    E: Display,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let result = exchange(comm, op).await;
    if let Err(e) = &result {
        error!("Rank {}/{}: {}", comm.rank(), comm.size(), e);
        comm.abort(ABORT_EXIT_CODE);
    }
    result
}

async fn exchange<C, T, E, F, Fut>(comm: &C, op: F) -> Result<T, MpiError>
where
    C: Communicator + ?Sized,
    T: Serialize + DeserializeOwned,
    E: Display,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let payload = if comm.rank() == ROOT {
        let outcome = match op().await {
            Ok(value) => Outcome::Ok(value),
            Err(e) => Outcome::Failed(e.to_string()),
        };
        Some(serde_json::to_vec(&outcome)?)
    } else {
        None
    };

    let bytes = comm.broadcast(ROOT, payload).await?;
    match serde_json::from_slice::<Outcome<T>>(&bytes)? {
        Outcome::Ok(value) => {
            debug!("Rank {} received first rank result", comm.rank());
            Ok(value)
        }
        Outcome::Failed(message) => Err(MpiError::RootFailed(message)),
    }
}

/// Runs `program` on rank 0 while the other ranks wait for it to finish
///
/// The program runs without the MPI runtime variables of this job.
/// A non-zero exit of the program aborts every rank.
pub async fn run_on_first_rank<C>(comm: &C, program: &str, args: &[String]) -> Result<(), MpiError>
where
    C: Communicator + ?Sized,
{
    first_rank_op(comm, || async {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args);
        // The program must not mistake itself for a rank of this job
        crate::env::sanitize(&mut cmd);
        let status = cmd
            .status()
            .await
            .map_err(|e| format!("failed to spawn '{}': {}", program, e))?;
        if status.success() {
            Ok(())
        } else {
            Err(format!("'{}' exited with {}", program, status))
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_single_rank_runs_op() {
        let comm = SingleRank;
        let value: u32 = first_rank_op(&comm, || async { Ok::<_, String>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_only_first_rank_writes() {
        let writes = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();

        for rank in LocalGroup::new(4) {
            let writes = Arc::clone(&writes);
            tasks.push(tokio::spawn(async move {
                first_rank_op(&rank, || async move {
                    writes.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>("out.json".to_string())
                })
                .await
            }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "out.json");
        }
        assert_eq!(writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_first_rank_failure_aborts_all_ranks() {
        let ranks = LocalGroup::new(3);
        let observer = ranks[1].clone();
        let mut tasks = Vec::new();

        for rank in ranks {
            tasks.push(tokio::spawn(async move {
                first_rank_op(&rank, || async { Err::<u32, _>("disk full") }).await
            }));
        }

        for task in tasks {
            match task.await.unwrap() {
                Err(MpiError::RootFailed(message)) => assert_eq!(message, "disk full"),
                other => panic!("expected RootFailed, got {:?}", other),
            }
        }
        assert_eq!(observer.aborted(), Some(ABORT_EXIT_CODE));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_on_first_rank() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("written");
        let script = format!("echo once >> {}", marker.display());
        let args = vec!["-c".to_string(), script];
        let mut tasks = Vec::new();

        for rank in LocalGroup::new(3) {
            let args = args.clone();
            tasks.push(tokio::spawn(async move {
                run_on_first_rank(&rank, "sh", &args).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(std::fs::read_to_string(&marker).unwrap(), "once\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_on_first_rank_failure() {
        let args = vec!["-c".to_string(), "exit 2".to_string()];
        let err = run_on_first_rank(&SingleRank, "sh", &args).await.unwrap_err();
        assert!(matches!(err, MpiError::RootFailed(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_on_first_rank_hides_mpi_runtime() {
        // SAFETY: the variable name is unique to this test
        unsafe { std::env::set_var("OMPI_SIMRUN_FIRST_RANK_MARKER", "outer-job") };
        let args = vec![
            "-c".to_string(),
            r#"test -z "$OMPI_SIMRUN_FIRST_RANK_MARKER""#.to_string(),
        ];

        let result = run_on_first_rank(&SingleRank, "sh", &args).await;
        unsafe { std::env::remove_var("OMPI_SIMRUN_FIRST_RANK_MARKER") };
        result.unwrap();
    }

    #[tokio::test]
    async fn test_consecutive_operations_stay_in_order() {
        let mut tasks = Vec::new();

        for rank in LocalGroup::new(2) {
            tasks.push(tokio::spawn(async move {
                let a: u32 = first_rank_op(&rank, || async { Ok::<_, String>(1) }).await?;
                let b: u32 = first_rank_op(&rank, || async { Ok::<_, String>(2) }).await?;
                Ok::<_, MpiError>((a, b))
            }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), (1, 2));
        }
    }
}
