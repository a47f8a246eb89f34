//! Long-running tasks and their shared state
//!
//! A task runs once. Workers share its [`TaskState`]: the finished flag doubles
//! as the cooperative cancellation signal, and the error slot keeps only the
//! first failure.

use super::compact::ArchiveCompactor;
use super::ReleasePatcher;
use crate::error::PatchError;
use anyhow::{bail, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use tracing::error;

#[derive(Debug, Default)]
pub struct TaskState {
    started: AtomicBool,
    finished: AtomicBool,
    cancelled: AtomicBool,
    error: OnceLock<String>,
    status: Mutex<String>,
}

impl TaskState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the single run. Returns `false` if the task already ran.
    pub fn begin(&self) -> bool {
        !self.started.swap(true, Ordering::SeqCst)
    }

    /// Workers stop at the next chunk boundary once this is true.
    pub fn should_stop(&self) -> bool {
        self.finished.load(Ordering::Acquire) || self.error.get().is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn finish(&self) {
        self.finished.store(true, Ordering::Release);
    }

    /// External cancellation. Stops every worker and suppresses the marker.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.finished.store(true, Ordering::Release);
    }

    /// Record a failure. Only the first one is kept; returns whether this
    /// call won.
    pub fn fail(&self, message: impl Into<String>) -> bool {
        let message = message.into();
        let won = self.error.set(message.clone()).is_ok();
        if won {
            error!("{}", message);
        }
        won
    }

    pub fn error(&self) -> Option<&str> {
        self.error.get().map(String::as_str)
    }

    pub fn set_status(&self, status: impl Into<String>) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status.into();
    }

    pub fn status(&self) -> String {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Common interface of everything the CLI can run and observe.
pub trait PatchTask: Send + Sync {
    fn name(&self) -> &'static str;

    fn state(&self) -> &TaskState;

    /// Completion in percent, 0..=100.
    fn percentage(&self) -> f32;

    /// Current transfer rate, if the task downloads anything.
    fn throughput_kib(&self) -> Option<f64> {
        None
    }

    /// Do the work. Callers go through [`run_task`].
    fn run(&self) -> Result<()>;
}

pub enum Task {
    Patch(ReleasePatcher),
    Compact(ArchiveCompactor),
}

impl Task {
    pub fn as_task(&self) -> &dyn PatchTask {
        match self {
            Task::Patch(patcher) => patcher,
            Task::Compact(compactor) => compactor,
        }
    }
}

/// Run a task once, recording any error on its state.
pub fn run_task(task: &dyn PatchTask) -> Result<()> {
    let state = task.state();
    if !state.begin() {
        bail!("Task '{}' has already run", task.name());
    }

    if let Err(e) = task.run() {
        state.fail(format!("{:#}", e));
    }

    match state.error() {
        Some(message) => bail!("{} failed: {}", task.name(), message),
        None if state.is_cancelled() => Err(PatchError::Cancelled.into()),
        None => Ok(()),
    }
}
