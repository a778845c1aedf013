//! Results of checkpoint operations.
//!
//! Navigation and event handling report expected conditions ("nothing
//! earlier", "no snapshot for this node") as values so callers can render a
//! message instead of treating them as failures.

use crate::{CheckpointEntry, SessionId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How much state a restore changes besides the files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreMode {
    /// Materialize files only.
    FilesOnly,
    /// Materialize files and move the conversation tree position to the node.
    FilesAndPosition,
}

/// User choice offered by a tree jump onto a node with a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JumpChoice {
    KeepFiles,
    FilesOnly,
    FilesAndPosition,
}

/// How a fork treats the working tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForkMode {
    ConversationOnly,
    RestoreAndConversation,
    RestoreFilesOnly,
}

impl ForkMode {
    pub fn restores_files(&self) -> bool {
        !matches!(self, Self::ConversationOnly)
    }

    pub fn forks_conversation(&self) -> bool {
        !matches!(self, Self::RestoreFilesOnly)
    }
}

/// What a materialization did to the working tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedResult {
    pub ref_name: String,
    /// Files whose content was (re)written.
    pub written: Vec<PathBuf>,
    /// Files removed because the snapshot does not contain them: tracked
    /// files, and untracked files an earlier restore created.
    pub removed: Vec<PathBuf>,
    /// Paths with staged changes, left in the index as they were.
    pub staged_preserved: Vec<PathBuf>,
    /// Untracked files absent from the snapshot, left in place.
    pub untracked_kept: Vec<PathBuf>,
    /// Files this restore brought into existence (or rewrote while they
    /// still held content an earlier restore created).
    #[serde(default)]
    pub created: Vec<CreatedFile>,
}

/// A working-tree file put there by a restore, with the blob it was given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedFile {
    pub path: PathBuf,
    pub object_id: String,
}

impl AppliedResult {
    pub fn is_noop(&self) -> bool {
        self.written.is_empty() && self.removed.is_empty()
    }
}

/// Result of feeding one conversation event to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EventOutcome {
    /// A checkpoint was recorded. `replaced` is the assistant entry it
    /// superseded, if any.
    Created {
        entry: CheckpointEntry,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        replaced: Option<CheckpointEntry>,
    },
    /// The working tree matched the most recent snapshot.
    Unchanged,
    /// The event never produces a checkpoint (tool node, repeated start).
    Ignored,
}

/// Result of a tree jump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JumpOutcome {
    /// The node has no snapshot; no restore is offered.
    NoSnapshot,
    /// The user chose to keep the current files.
    KeptFiles { entry: CheckpointEntry },
    Restored {
        entry: CheckpointEntry,
        mode: RestoreMode,
        applied: AppliedResult,
    },
}

/// Result of undo/redo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NavigationOutcome {
    Restored {
        entry: CheckpointEntry,
        applied: AppliedResult,
    },
    NothingEarlier,
    NothingLater,
}

/// Which snapshot a fork restored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForkSource {
    /// The target node's own checkpoint.
    Node,
    /// The session's resume checkpoint, used when the node has none.
    ResumeFallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkRestore {
    pub source: ForkSource,
    pub entry: CheckpointEntry,
    pub applied: AppliedResult,
}

/// Result of a fork.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkOutcome {
    /// Whether the caller should fork the conversation at the node.
    pub fork_conversation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore: Option<ForkRestore>,
    /// A restore was requested but neither the node nor the session start
    /// has a snapshot.
    #[serde(default)]
    pub no_snapshot: bool,
}

/// Result of clearing a session's checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearReport {
    pub session_id: SessionId,
    pub refs_deleted: usize,
    pub entries_removed: usize,
}
