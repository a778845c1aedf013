//! The only code path that writes snapshot content into a working tree.

use crate::registry::CheckpointRegistry;
use crate::snapshot_store::{MergePolicy, SnapshotStore};
use crate::Result;
use cairn_types::{AppliedResult, CheckpointEntry, NodeId, RestoreMode, SessionId};
use std::sync::Arc;
use tracing::{info, warn};

/// External conversation-tree position pointer.
pub trait TreePosition: Send + Sync {
    fn set_tree_position(&self, session_id: &SessionId, node_id: &NodeId);
}

pub struct RestoreOrchestrator {
    policy: MergePolicy,
    position: Arc<dyn TreePosition>,
}

impl RestoreOrchestrator {
    pub fn new(policy: MergePolicy, position: Arc<dyn TreePosition>) -> Self {
        Self { policy, position }
    }

    /// Materialize `entry`'s snapshot. With [`RestoreMode::FilesAndPosition`]
    /// the tree position moves to the entry's node once the files are in
    /// place; a failed materialization never moves it.
    pub fn restore(
        &self,
        registry: &mut CheckpointRegistry,
        entry: &CheckpointEntry,
        mode: RestoreMode,
    ) -> Result<AppliedResult> {
        let session_id = registry.session_id().clone();
        let applied = registry
            .store()
            .apply(&entry.snapshot.ref_name, &self.policy, registry.restored_files())
            .inspect_err(|e| {
                warn!(target: "cairn::restore",
                    "Restore of {} for {} failed (working tree unchanged: {}): {}",
                    entry.snapshot.ref_name, session_id, e.tree_unchanged(), e);
            })?;
        registry.note_restore(&applied);

        if mode == RestoreMode::FilesAndPosition {
            self.position.set_tree_position(&session_id, &entry.node_id);
        }

        info!(target: "cairn::restore",
            "Restored {} checkpoint #{} ({}) for {}: {} written, {} removed",
            entry.role, entry.sequence, entry.snapshot.ref_name, session_id,
            applied.written.len(), applied.removed.len());
        if !applied.staged_preserved.is_empty() {
            info!(target: "cairn::restore",
                "Kept {} staged paths in the index", applied.staged_preserved.len());
        }
        Ok(applied)
    }
}
