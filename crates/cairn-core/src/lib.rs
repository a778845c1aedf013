//! Checkpoint and restore engine for branching conversation sessions.

mod error;
mod index;
mod manager;
mod registry;
mod restore;
mod snapshot_store;
mod staging;
mod timeline;

pub use error::CairnError;
pub use index::{CheckpointIndex, SessionRow};
pub use manager::{CheckpointManager, CheckpointManagerConfig};
pub use registry::CheckpointRegistry;
pub use restore::{RestoreOrchestrator, TreePosition};
pub use snapshot_store::{
    GitSnapshotStore, MergePolicy, SnapshotLabel, SnapshotRecord, SnapshotStore,
    DEFAULT_MAX_UNTRACKED_BYTES, REF_NAMESPACE,
};
pub use staging::STAGING_DIR;
pub use timeline::{Timeline, TimelineBoundary};

/// Result type for Cairn operations.
pub type Result<T> = std::result::Result<T, CairnError>;
