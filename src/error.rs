//! Error taxonomy for patch runs.
//!
//! Most plumbing returns `anyhow::Result` with context attached. The variants
//! here are the conditions callers need to tell apart: a transport failure
//! aborts the phase, an integrity mismatch is recovered by refetching, a
//! structural error aborts the task, and a broken installation asks the user
//! to run a repair.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("HTTP {status} for {path}")]
    Transport { path: String, status: u16 },

    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    Integrity {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("{0}")]
    Structural(String),

    #[error("Invalid installation ({reason}) at {}. Run a repair first.", path.display())]
    RepairRequired { path: PathBuf, reason: String },

    #[error("task cancelled")]
    Cancelled,
}

impl PatchError {
    pub fn structural(message: impl Into<String>) -> Self {
        PatchError::Structural(message.into())
    }

    pub fn repair(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        PatchError::RepairRequired {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
