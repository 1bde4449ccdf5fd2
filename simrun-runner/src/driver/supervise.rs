//! Building blocks shared by the driver backends
//!
//! - [`Completion`]: one-shot exit signal that any number of waiters can await
//! - [`KillTimer`]: delayed forced kill that is replaced by every new kill
//!   request and permanently closed once the process has exited

use simrun_core::domain::job::ExitState;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{Result, RunnerError};

/// Creates a linked completion sender/receiver pair
pub fn completion(id: impl Into<String>) -> (CompletionSender, Completion) {
    let (tx, rx) = watch::channel(ExitState::Running);
    (
        CompletionSender { tx },
        Completion { id: id.into(), rx },
    )
}

/// Resolves a [`Completion`]; consumed so the exit is reported once
pub struct CompletionSender {
    tx: watch::Sender<ExitState>,
}

impl CompletionSender {
    pub fn complete(self, state: ExitState) {
        // Receivers may all be gone if the handle was dropped
        let _ = self.tx.send(state);
    }
}

/// Receiving side of the exit signal
#[derive(Clone)]
pub struct Completion {
    id: String,
    rx: watch::Receiver<ExitState>,
}

impl Completion {
    /// Current state without waiting
    pub fn peek(&self) -> ExitState {
        *self.rx.borrow()
    }

    pub fn is_done(&self) -> bool {
        self.peek().is_terminal()
    }

    /// Suspends until the process exits
    pub async fn wait(&self) -> Result<ExitState> {
        let mut rx = self.rx.clone();
        let state = rx
            .wait_for(ExitState::is_terminal)
            .await
            .map(|state| *state);
        state.map_err(|_| RunnerError::MonitorLost(self.id.clone()))
    }
}

#[derive(Default)]
struct TimerSlot {
    pending: Option<JoinHandle<()>>,
    closed: bool,
}

/// Delayed forced kill
#[derive(Default)]
pub struct KillTimer {
    slot: Mutex<TimerSlot>,
}

impl KillTimer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TimerSlot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Runs `force` after `grace`, replacing any pending timer
    ///
    /// Returns false if the timer was already closed.
    pub fn arm<F>(&self, grace: Duration, force: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.lock();
        if let Some(previous) = slot.pending.take() {
            debug!("Replacing pending kill timer");
            previous.abort();
        }
        if slot.closed {
            return false;
        }
        slot.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            force.await;
        }));
        true
    }

    /// Cancels the pending timer, if any
    pub fn disarm(&self) -> bool {
        match self.lock().pending.take() {
            Some(pending) => {
                pending.abort();
                true
            }
            None => false,
        }
    }

    /// Cancels the pending timer and refuses to arm again
    ///
    /// Called by the monitor once the process has exited.
    pub fn close(&self) {
        let mut slot = self.lock();
        slot.closed = true;
        if let Some(pending) = slot.pending.take() {
            pending.abort();
        }
    }
}

impl Drop for KillTimer {
    fn drop(&mut self) {
        if let Some(pending) = self.lock().pending.take() {
            pending.abort();
        }
    }
}
