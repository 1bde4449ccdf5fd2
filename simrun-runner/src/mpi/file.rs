//! Broadcast through a shared directory
//!
//! Ranks started by `mpiexec` share the run directory. Rank 0 publishes each
//! broadcast as `<dir>/.simrun-mpi/<session>/bcast-<call>-<seq>.json`
//! (written to a temp file, then renamed) and the other ranks poll for it.
//! Aborting writes an `abort-<call>` marker that releases every polling rank,
//! then exits.
//!
//! One `mpiexec` job may create several communicators in turn, one per
//! `simrun first-rank` step. Each rank counts its own communicators in
//! `rank-<rank>.calls`; since all ranks run the same steps in the same order,
//! the n-th communicator of every rank gets the same `call` and never sees
//! messages or abort markers of an earlier step.

use async_trait::async_trait;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use super::{Communicator, MpiError};

/// Directory below the run directory holding broadcast sessions
pub const SESSION_DIR: &str = ".simrun-mpi";

const ABORT_MARKER: &str = "abort";
const DEFAULT_POLL: Duration = Duration::from_millis(100);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Rank of an `mpiexec` job, coordinating through files
#[derive(Debug)]
pub struct FileCommunicator {
    rank: usize,
    size: usize,
    dir: PathBuf,
    /// Position of this communicator among the rank's communicators
    call: u64,
    seq: AtomicU64,
    poll: Duration,
    timeout: Duration,
}

impl FileCommunicator {
    /// Creates a communicator with explicit rank and session
    pub fn new(
        base: &Path,
        session: &str,
        rank: usize,
        size: usize,
    ) -> Result<Self, MpiError> {
        if size == 0 || rank >= size {
            return Err(MpiError::Environment(format!(
                "rank {} out of range for size {}",
                rank, size
            )));
        }
        let dir = base.join(SESSION_DIR).join(session);
        fs::create_dir_all(&dir).map_err(|source| MpiError::Io {
            path: dir.clone(),
            source,
        })?;
        let call = next_call(&dir, rank)?;
        debug!("Rank {} joined session call {}", rank, call);
        Ok(Self {
            rank,
            size,
            dir,
            call,
            seq: AtomicU64::new(0),
            poll: DEFAULT_POLL,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Detects rank, size and session from the MPI launcher's environment
    ///
    /// Returns `Ok(None)` when the process was not started by `mpiexec`.
    pub fn from_env(base: &Path) -> Result<Option<Self>, MpiError> {
        Self::from_vars(base, |key| std::env::var(key).ok())
    }

    fn from_vars<F>(base: &Path, var: F) -> Result<Option<Self>, MpiError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |keys: &[&str]| keys.iter().find_map(|&key| var(key));

        let (rank, size) = match (
            first(&["OMPI_COMM_WORLD_RANK", "PMIX_RANK", "PMI_RANK"]),
            first(&["OMPI_COMM_WORLD_SIZE", "PMI_SIZE"]),
        ) {
            (Some(rank), Some(size)) => (rank, size),
            (None, None) => return Ok(None),
            (rank, size) => {
                return Err(MpiError::Environment(format!(
                    "incomplete rank information (rank={:?}, size={:?})",
                    rank, size
                )));
            }
        };
        let parse = |name: &str, value: &str| {
            value
                .trim()
                .parse::<usize>()
                .map_err(|_| MpiError::Environment(format!("{} '{}' is not a number", name, value)))
        };
        let rank = parse("rank", &rank)?;
        let size = parse("size", &size)?;

        // Every rank of one launch shares the namespace, or else the launcher as parent
        let session = first(&["PMIX_NAMESPACE", "OMPI_MCA_orte_ess_jobid", "PMI_KVSNAME"])
            .unwrap_or_else(|| format!("ppid-{}", parent_pid()));
        let session: String = session
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();

        Self::new(base, &session, rank, size).map(Some)
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn session_dir(&self) -> &Path {
        &self.dir
    }

    pub fn call(&self) -> u64 {
        self.call
    }

    fn message_path(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("bcast-{}-{}.json", self.call, seq))
    }

    fn abort_path(&self) -> PathBuf {
        self.dir.join(format!("{}-{}", ABORT_MARKER, self.call))
    }

    fn read_abort(&self) -> Option<i32> {
        let content = fs::read_to_string(self.abort_path()).ok()?;
        Some(content.trim().parse().unwrap_or(super::ABORT_EXIT_CODE))
    }

    fn io_error(path: &Path, source: io::Error) -> MpiError {
        MpiError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn publish(&self, path: &Path, payload: &[u8]) -> Result<(), MpiError> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, payload).map_err(|e| Self::io_error(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| Self::io_error(path, e))
    }

    /// Writes the abort marker without exiting
    pub fn mark_aborted(&self, code: i32) -> Result<(), MpiError> {
        let path = self.abort_path();
        fs::write(&path, code.to_string()).map_err(|e| Self::io_error(&path, e))
    }
}

#[async_trait]
impl Communicator for FileCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    async fn broadcast(&self, root: usize, payload: Option<Vec<u8>>) -> Result<Vec<u8>, MpiError> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let path = self.message_path(seq);

        if self.rank == root {
            let payload = payload.ok_or(MpiError::MissingPayload { rank: self.rank })?;
            self.publish(&path, &payload)?;
            debug!("Rank {} published broadcast {}", self.rank, seq);
            return Ok(payload);
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            match fs::read(&path) {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(Self::io_error(&path, e)),
            }
            if let Some(code) = self.read_abort() {
                return Err(MpiError::Aborted(code));
            }
            if Instant::now() >= deadline {
                return Err(MpiError::Timeout { root, seq });
            }
            tokio::time::sleep(self.poll).await;
        }
    }

    fn abort(&self, code: i32) {
        error!("Rank {}/{} aborting with code {}", self.rank, self.size, code);
        if let Err(e) = self.mark_aborted(code) {
            error!("Failed to publish abort: {}", e);
        }
        std::process::exit(code);
    }
}

/// Claims the next call number of `rank` in the session `dir`
///
/// Only the process of `rank` touches its counter file.
fn next_call(dir: &Path, rank: usize) -> Result<u64, MpiError> {
    let path = dir.join(format!("rank-{}.calls", rank));
    let call = match fs::read_to_string(&path) {
        Ok(content) => content.trim().parse::<u64>().map_err(|_| {
            MpiError::Environment(format!("corrupt call counter {}", path.display()))
        })?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
        Err(e) => return Err(FileCommunicator::io_error(&path, e)),
    };
    fs::write(&path, (call + 1).to_string())
        .map_err(|e| FileCommunicator::io_error(&path, e))?;
    Ok(call)
}

/// Removes broadcast sessions left in a run directory
///
/// Called by the supervisor once the whole MPI job has exited.
pub fn clear_sessions(run_dir: &Path) -> io::Result<()> {
    let dir = run_dir.join(SESSION_DIR);
    match fs::remove_dir_all(&dir) {
        Ok(()) => {
            info!("Removed MPI session directory {}", dir.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn parent_pid() -> u32 {
    std::os::unix::process::parent_id()
}

#[cfg(not(unix))]
fn parent_pid() -> u32 {
    0
}
