//! Error types for Cairn.

use cairn_types::InvalidSessionId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CairnError {
    #[error("Snapshot backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("A restore is already in progress for session {0}")]
    RestoreInProgress(String),

    #[error("Write failed, working tree left unchanged: {0}")]
    WriteFailed(String),

    #[error("Write failed and rollback was incomplete: {0}")]
    RollbackIncomplete(String),

    #[error(transparent)]
    InvalidSessionId(#[from] InvalidSessionId),

    #[error("Git error: {0}")]
    GitError(#[from] git2::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl CairnError {
    /// Whether the working tree is known to be in its pre-attempt state.
    pub fn tree_unchanged(&self) -> bool {
        !matches!(self, Self::RollbackIncomplete(_))
    }
}
