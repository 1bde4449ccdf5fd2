//! Communicators

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{error, warn};

use super::MpiError;

/// Collective operations needed for single-writer coordination
#[async_trait]
pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Delivers `root`'s payload to every rank
    ///
    /// The root passes `Some(payload)`, the other ranks pass `None`. Every
    /// rank must take part, in the same order.
    async fn broadcast(&self, root: usize, payload: Option<Vec<u8>>) -> Result<Vec<u8>, MpiError>;

    /// Tears down every rank of the job
    fn abort(&self, code: i32);
}

/// Communicator of a job that is not running under MPI
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleRank;

#[async_trait]
impl Communicator for SingleRank {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    async fn broadcast(&self, _root: usize, payload: Option<Vec<u8>>) -> Result<Vec<u8>, MpiError> {
        payload.ok_or(MpiError::MissingPayload { rank: 0 })
    }

    fn abort(&self, code: i32) {
        // Nothing else to tear down; the caller exits with the error
        warn!("Abort requested with code {} on single rank", code);
    }
}

struct Message {
    payload: Vec<u8>,
    /// Ranks that still have to read the message
    pending: usize,
}

#[derive(Default)]
struct GroupState {
    messages: HashMap<u64, Message>,
    aborted: Option<i32>,
}

struct Shared {
    state: Mutex<GroupState>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, GroupState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One rank of a group of ranks living in the same process
///
/// Useful to fan a job out over tasks with the same coordination rules as
/// a real MPI job.
pub struct LocalGroup {
    rank: usize,
    size: usize,
    seq: AtomicU64,
    shared: Arc<Shared>,
}

impl LocalGroup {
    /// Creates the ranks of a new group
    pub fn new(size: usize) -> Vec<LocalGroup> {
        let shared = Arc::new(Shared {
            state: Mutex::new(GroupState::default()),
            notify: Notify::new(),
        });
        (0..size)
            .map(|rank| LocalGroup {
                rank,
                size,
                seq: AtomicU64::new(0),
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    /// Abort code, once any rank aborted
    pub fn aborted(&self) -> Option<i32> {
        self.shared.lock().aborted
    }
}

impl Clone for LocalGroup {
    fn clone(&self) -> Self {
        Self {
            rank: self.rank,
            size: self.size,
            seq: AtomicU64::new(self.seq.load(Ordering::SeqCst)),
            shared: Arc::clone(&self.shared),
        }
    }
}

#[async_trait]
impl Communicator for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    async fn broadcast(&self, root: usize, payload: Option<Vec<u8>>) -> Result<Vec<u8>, MpiError> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);

        if self.rank == root {
            let payload = payload.ok_or(MpiError::MissingPayload { rank: self.rank })?;
            let mut state = self.shared.lock();
            if let Some(code) = state.aborted {
                return Err(MpiError::Aborted(code));
            }
            if self.size > 1 {
                state.messages.insert(
                    seq,
                    Message {
                        payload: payload.clone(),
                        pending: self.size - 1,
                    },
                );
            }
            drop(state);
            self.shared.notify.notify_waiters();
            return Ok(payload);
        }

        loop {
            // Registered before checking so a notify in between is not lost
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.lock();
                // A message sent before an abort is still delivered
                if let Some(message) = state.messages.get_mut(&seq) {
                    let payload = message.payload.clone();
                    message.pending -= 1;
                    if message.pending == 0 {
                        state.messages.remove(&seq);
                    }
                    return Ok(payload);
                }
                if let Some(code) = state.aborted {
                    return Err(MpiError::Aborted(code));
                }
            }
            notified.await;
        }
    }

    fn abort(&self, code: i32) {
        error!("Rank {} aborting group with code {}", self.rank, code);
        let mut state = self.shared.lock();
        state.aborted.get_or_insert(code);
        drop(state);
        self.shared.notify.notify_waiters();
    }
}
