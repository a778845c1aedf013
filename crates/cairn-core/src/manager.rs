//! Per-session checkpoint state and the user-facing operations.

use crate::index::CheckpointIndex;
use crate::registry::CheckpointRegistry;
use crate::restore::{RestoreOrchestrator, TreePosition};
use crate::snapshot_store::{GitSnapshotStore, MergePolicy, DEFAULT_MAX_UNTRACKED_BYTES};
use crate::timeline::TimelineBoundary;
use crate::{CairnError, Result};
use cairn_types::{
    ClearReport, ConversationEvent, EventOutcome, ForkMode, ForkOutcome, ForkRestore, ForkSource,
    JumpChoice, JumpOutcome, NavigationOutcome, NodeId, RestoreMode, SessionId, TimelineItem,
};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use tracing::{debug, info, warn};

/// Configuration for the checkpoint manager.
#[derive(Debug, Clone)]
pub struct CheckpointManagerConfig {
    pub db_path: PathBuf,
    /// Repository used for sessions whose start event names none.
    pub default_project_dir: Option<PathBuf>,
    pub merge_policy: MergePolicy,
    pub max_untracked_bytes: u64,
}

impl Default for CheckpointManagerConfig {
    fn default() -> Self {
        Self {
            db_path: dirs::data_local_dir()
                .unwrap_or_default()
                .join("cairn")
                .join("checkpoints.db"),
            default_project_dir: None,
            merge_policy: MergePolicy::default(),
            max_untracked_bytes: DEFAULT_MAX_UNTRACKED_BYTES,
        }
    }
}

type SessionHandle = Arc<Mutex<CheckpointRegistry>>;

#[derive(Debug, Clone, Copy)]
enum Step {
    Back,
    Forward,
}

/// Owns one registry per session and routes events and navigation to it.
pub struct CheckpointManager {
    config: CheckpointManagerConfig,
    index: Arc<CheckpointIndex>,
    orchestrator: RestoreOrchestrator,
    sessions: DashMap<SessionId, SessionHandle>,
}

impl CheckpointManager {
    /// Create a manager backed by the index at `config.db_path`.
    pub fn new(config: CheckpointManagerConfig, position: Arc<dyn TreePosition>) -> Result<Self> {
        let index = CheckpointIndex::open(&config.db_path)?;
        Ok(Self::with_index(config, index, position))
    }

    pub fn with_index(
        config: CheckpointManagerConfig,
        index: CheckpointIndex,
        position: Arc<dyn TreePosition>,
    ) -> Self {
        let orchestrator = RestoreOrchestrator::new(config.merge_policy, position);
        Self {
            config,
            index: Arc::new(index),
            orchestrator,
            sessions: DashMap::new(),
        }
    }

    /// Find a session already bound to a project directory. Never creates
    /// a binding.
    fn find_session(&self, session_id: &SessionId) -> Result<Option<SessionHandle>> {
        if let Some(handle) = self.sessions.get(session_id) {
            return Ok(Some(handle.clone()));
        }
        match self.index.get_session(session_id)? {
            Some(row) => self.load_session(session_id, row.project_dir).map(Some),
            None => Ok(None),
        }
    }

    /// Find or load a session for an event, binding it to a project
    /// directory on first sight. `None` when no directory is available.
    fn open_session(
        &self,
        session_id: &SessionId,
        project_dir: Option<&Path>,
    ) -> Result<Option<SessionHandle>> {
        if let Some(handle) = self.sessions.get(session_id) {
            return Ok(Some(handle.clone()));
        }

        let dir = match self.index.get_session(session_id)? {
            Some(row) => {
                if let Some(requested) = project_dir.filter(|d| *d != row.project_dir.as_path()) {
                    warn!(target: "cairn::registry",
                        "Session {} is bound to {}, ignoring {}",
                        session_id, row.project_dir.display(), requested.display());
                }
                row.project_dir
            }
            None => match project_dir
                .map(Path::to_path_buf)
                .or_else(|| self.config.default_project_dir.clone())
            {
                Some(dir) => dir,
                None => return Ok(None),
            },
        };

        self.index.upsert_session(session_id, &dir)?;
        self.load_session(session_id, dir).map(Some)
    }

    fn load_session(&self, session_id: &SessionId, dir: PathBuf) -> Result<SessionHandle> {
        let store = GitSnapshotStore::new(&dir, session_id.clone())
            .with_max_untracked_bytes(self.config.max_untracked_bytes);
        let registry = CheckpointRegistry::load(session_id.clone(), Box::new(store), self.index.clone())?;
        debug!(target: "cairn::registry", "Opened session {} on {}", session_id, dir.display());

        let handle = self
            .sessions
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(registry)))
            .clone();
        Ok(handle)
    }

    /// Feed one conversation event to its session's registry.
    pub fn handle_event(&self, event: &ConversationEvent) -> Result<EventOutcome> {
        let session_id = event.session_id();
        let project_dir = match event {
            ConversationEvent::SessionStart { project_dir, .. } => project_dir.as_deref(),
            _ => None,
        };
        let handle = self.open_session(session_id, project_dir)?.ok_or_else(|| {
            CairnError::BackendUnavailable(format!(
                "no project directory known for session {session_id}"
            ))
        })?;

        debug!(target: "cairn::events",
            "{:?} node {} in {}", event.node_kind(), event.node_id(), session_id);
        let mut registry = lock(&handle);
        registry.handle_event(event)
    }

    /// Whether a restore can be offered for `node_id`.
    pub fn has_snapshot(&self, session_id: &SessionId, node_id: &NodeId) -> Result<bool> {
        let Some(handle) = self.find_session(session_id)? else {
            return Ok(false);
        };
        let registry = lock(&handle);
        Ok(registry.resolve(node_id).is_some())
    }

    pub fn list_timeline(&self, session_id: &SessionId) -> Result<Vec<TimelineItem>> {
        let Some(handle) = self.find_session(session_id)? else {
            return Ok(Vec::new());
        };
        let registry = lock(&handle);
        Ok(registry.timeline().list().collect())
    }

    /// Restore for a jump to `node_id` in the conversation tree.
    pub fn tree_jump(
        &self,
        session_id: &SessionId,
        node_id: &NodeId,
        choice: JumpChoice,
    ) -> Result<JumpOutcome> {
        let Some(handle) = self.find_session(session_id)? else {
            return Ok(JumpOutcome::NoSnapshot);
        };
        let mut registry = try_lock(session_id, &handle)?;
        let Some(entry) = registry.resolve(node_id).cloned() else {
            debug!(target: "cairn::restore", "No snapshot for node {} in {}", node_id, session_id);
            return Ok(JumpOutcome::NoSnapshot);
        };

        let mode = match choice {
            JumpChoice::KeepFiles => return Ok(JumpOutcome::KeptFiles { entry }),
            JumpChoice::FilesOnly => RestoreMode::FilesOnly,
            JumpChoice::FilesAndPosition => RestoreMode::FilesAndPosition,
        };
        let applied = self.orchestrator.restore(&mut registry, &entry, mode)?;

        if mode == RestoreMode::FilesAndPosition && registry.timeline_mut().seek(entry.sequence) {
            registry.save_cursor()?;
        }
        Ok(JumpOutcome::Restored {
            entry,
            mode,
            applied,
        })
    }

    pub fn undo(&self, session_id: &SessionId) -> Result<NavigationOutcome> {
        self.step(session_id, Step::Back)
    }

    pub fn redo(&self, session_id: &SessionId) -> Result<NavigationOutcome> {
        self.step(session_id, Step::Forward)
    }

    fn step(&self, session_id: &SessionId, step: Step) -> Result<NavigationOutcome> {
        let Some(handle) = self.find_session(session_id)? else {
            return Ok(boundary_outcome(step));
        };
        let mut registry = try_lock(session_id, &handle)?;

        let previous = registry.timeline().cursor_sequence();
        let moved = match step {
            Step::Back => registry.timeline_mut().back(),
            Step::Forward => registry.timeline_mut().forward(),
        }
        .cloned();
        let entry = match moved {
            Ok(entry) => entry,
            Err(boundary) => {
                info!(target: "cairn::timeline", "{} in {}", boundary, session_id);
                return Ok(match boundary {
                    TimelineBoundary::NoEarlierEntry => NavigationOutcome::NothingEarlier,
                    TimelineBoundary::NoLaterEntry => NavigationOutcome::NothingLater,
                });
            }
        };

        match self
            .orchestrator
            .restore(&mut registry, &entry, RestoreMode::FilesAndPosition)
        {
            Ok(applied) => {
                registry.save_cursor()?;
                Ok(NavigationOutcome::Restored { entry, applied })
            }
            Err(e) => {
                registry.timeline_mut().reposition(previous);
                Err(e)
            }
        }
    }

    /// Restore files for a fork at `node_id`, falling back to the session's
    /// resume checkpoint when the node has none.
    pub fn fork(
        &self,
        session_id: &SessionId,
        node_id: &NodeId,
        mode: ForkMode,
    ) -> Result<ForkOutcome> {
        let fork_conversation = mode.forks_conversation();
        let no_restore = |no_snapshot| ForkOutcome {
            fork_conversation,
            restore: None,
            no_snapshot,
        };
        if !mode.restores_files() {
            return Ok(no_restore(false));
        }
        let Some(handle) = self.find_session(session_id)? else {
            return Ok(no_restore(true));
        };
        let mut registry = try_lock(session_id, &handle)?;

        if let Some(entry) = registry.resolve(node_id).cloned() {
            match self
                .orchestrator
                .restore(&mut registry, &entry, RestoreMode::FilesOnly)
            {
                Ok(applied) => {
                    return Ok(ForkOutcome {
                        fork_conversation,
                        restore: Some(ForkRestore {
                            source: ForkSource::Node,
                            entry,
                            applied,
                        }),
                        no_snapshot: false,
                    });
                }
                Err(CairnError::SnapshotNotFound(r)) => {
                    warn!(target: "cairn::restore",
                        "Snapshot {} for node {} is gone, falling back to resume", r, node_id);
                }
                Err(e) => return Err(e),
            }
        }

        let Some(resume) = registry.resume().cloned() else {
            warn!(target: "cairn::restore", "Session {} has no resume checkpoint to fork from", session_id);
            return Ok(no_restore(true));
        };
        debug!(target: "cairn::restore", "Forking {} at {} from the resume checkpoint", session_id, node_id);
        match self
            .orchestrator
            .restore(&mut registry, &resume, RestoreMode::FilesOnly)
        {
            Ok(applied) => Ok(ForkOutcome {
                fork_conversation,
                restore: Some(ForkRestore {
                    source: ForkSource::ResumeFallback,
                    entry: resume,
                    applied,
                }),
                no_snapshot: false,
            }),
            Err(CairnError::SnapshotNotFound(r)) => {
                warn!(target: "cairn::restore", "Resume snapshot {} is gone", r);
                Ok(no_restore(true))
            }
            Err(e) => Err(e),
        }
    }

    /// Delete every checkpoint of one session and reset its in-memory state.
    pub fn clear(&self, session_id: &SessionId) -> Result<ClearReport> {
        let handle = self.find_session(session_id)?;
        let guard = handle
            .as_ref()
            .map(|h| try_lock(session_id, h))
            .transpose()?;

        let mut refs_deleted = 0;
        if let Some(registry) = &guard {
            let records = match registry.store().list("") {
                Ok(records) => records,
                Err(CairnError::BackendUnavailable(_)) => Vec::new(),
                Err(e) => return Err(e),
            };
            for record in &records {
                registry.store().delete(&record.snapshot.ref_name)?;
                refs_deleted += 1;
            }
        }
        let entries_removed = self.index.clear_session(session_id)?;
        if let Some(mut registry) = guard {
            registry.reset();
        }

        info!(target: "cairn::registry",
            "Cleared {}: {} refs deleted, {} entries removed", session_id, refs_deleted, entries_removed);
        Ok(ClearReport {
            session_id: session_id.clone(),
            refs_deleted,
            entries_removed,
        })
    }
}

fn boundary_outcome(step: Step) -> NavigationOutcome {
    match step {
        Step::Back => NavigationOutcome::NothingEarlier,
        Step::Forward => NavigationOutcome::NothingLater,
    }
}

fn lock(handle: &SessionHandle) -> MutexGuard<'_, CheckpointRegistry> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Take the session lock for a restore, rejecting the request if another
/// restore holds it.
fn try_lock<'a>(
    session_id: &SessionId,
    handle: &'a SessionHandle,
) -> Result<MutexGuard<'a, CheckpointRegistry>> {
    match handle.try_lock() {
        Ok(guard) => Ok(guard),
        Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => {
            Err(CairnError::RestoreInProgress(session_id.to_string()))
        }
    }
}
