//! Per-session checkpoint registry.
//!
//! Turns conversation events into checkpoint entries, keeps at most one
//! resume and one assistant entry, and owns the session's timeline. Every
//! change is written through to the [`CheckpointIndex`].

use crate::index::CheckpointIndex;
use crate::snapshot_store::{SnapshotLabel, SnapshotRecord, SnapshotStore};
use crate::timeline::Timeline;
use crate::{CairnError, Result};
use cairn_types::{
    AppliedResult, CheckpointEntry, CheckpointRole, ConversationEvent, CreatedFile, EventOutcome,
    NodeId, NodeSummary, SessionId, Snapshot,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct CheckpointRegistry {
    session_id: SessionId,
    store: Box<dyn SnapshotStore>,
    index: Arc<CheckpointIndex>,
    /// All live entries keyed by sequence.
    entries: BTreeMap<u64, CheckpointEntry>,
    timeline: Timeline,
    /// Most recently created snapshot; baseline for change detection.
    last_snapshot: Option<Snapshot>,
    next_sequence: u64,
    /// Files restores created since the last checkpoint.
    restored: Vec<CreatedFile>,
}

impl CheckpointRegistry {
    /// Load a session from the index, reconciling it with the refs the store
    /// actually holds.
    pub fn load(
        session_id: SessionId,
        store: Box<dyn SnapshotStore>,
        index: Arc<CheckpointIndex>,
    ) -> Result<Self> {
        let row = index.get_session(&session_id)?;
        let mut entries: BTreeMap<u64, CheckpointEntry> = index
            .list_entries(&session_id)?
            .into_iter()
            .map(|e| (e.sequence, e))
            .collect();

        let records = match store.list("") {
            Ok(records) => Some(records),
            Err(CairnError::BackendUnavailable(reason)) => {
                debug!(target: "cairn::registry",
                    "Skipping ref reconciliation for {}: {}", session_id, reason);
                None
            }
            Err(e) => return Err(e),
        };

        let mut rebuilt_cursor = None;
        if let Some(records) = records {
            if entries.is_empty() && !records.is_empty() {
                entries = rebuild_from_refs(&session_id, store.as_ref(), &index, records)?;
                rebuilt_cursor = entries
                    .values()
                    .filter(|e| e.role.on_timeline())
                    .map(|e| e.sequence)
                    .last();
                info!(target: "cairn::registry",
                    "Rebuilt {} checkpoints for {} from refs", entries.len(), session_id);
            } else {
                prune_missing(&session_id, store.as_ref(), &index, &mut entries, &records)?;
            }
        }

        let cursor = match rebuilt_cursor {
            Some(seq) => {
                index.set_cursor(&session_id, Some(seq))?;
                Some(seq)
            }
            None => index.get_cursor(&session_id)?,
        };

        let max_sequence = entries.keys().next_back().copied().unwrap_or(0);
        let next_sequence = row
            .map(|r| r.next_sequence)
            .unwrap_or(1)
            .max(max_sequence + 1);
        let last_snapshot = entries.values().next_back().map(|e| e.snapshot.clone());
        let timeline = Timeline::from_entries(entries.values().cloned(), cursor);

        debug!(target: "cairn::registry",
            "Loaded {} checkpoints for {} (next sequence {})",
            entries.len(), session_id, next_sequence);

        Ok(Self {
            session_id,
            store,
            index,
            entries,
            timeline,
            last_snapshot,
            next_sequence,
            restored: Vec::new(),
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn store(&self) -> &dyn SnapshotStore {
        self.store.as_ref()
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    /// Cursor moves made here are not persisted until [`Self::save_cursor`].
    pub fn timeline_mut(&mut self) -> &mut Timeline {
        &mut self.timeline
    }

    pub fn save_cursor(&self) -> Result<()> {
        self.index
            .set_cursor(&self.session_id, self.timeline.cursor_sequence())
    }

    pub fn restored_files(&self) -> &[CreatedFile] {
        &self.restored
    }

    /// Track the files a successful restore created, dropping those it
    /// removed or took over.
    pub fn note_restore(&mut self, applied: &AppliedResult) {
        self.restored.retain(|f| {
            !applied.removed.contains(&f.path)
                && !applied.created.iter().any(|c| c.path == f.path)
        });
        self.restored.extend(applied.created.iter().cloned());
    }

    pub fn entries(&self) -> impl Iterator<Item = &CheckpointEntry> {
        self.entries.values()
    }

    pub fn resume(&self) -> Option<&CheckpointEntry> {
        self.entries
            .values()
            .find(|e| e.role == CheckpointRole::Resume)
    }

    pub fn assistant(&self) -> Option<&CheckpointEntry> {
        self.entries
            .values()
            .find(|e| e.role == CheckpointRole::Assistant)
    }

    /// The restorable checkpoint bound to `node_id`.
    ///
    /// Resume entries are excluded; they are only reachable through
    /// [`Self::resume`].
    pub fn resolve(&self, node_id: &NodeId) -> Option<&CheckpointEntry> {
        self.entries
            .values()
            .rev()
            .find(|e| e.role.on_timeline() && &e.node_id == node_id)
    }

    pub fn handle_event(&mut self, event: &ConversationEvent) -> Result<EventOutcome> {
        match event {
            ConversationEvent::SessionStart {
                node_id, timestamp, ..
            } => {
                if self.resume().is_some() {
                    debug!(target: "cairn::registry",
                        "Session {} already has a resume checkpoint", self.session_id);
                    return Ok(EventOutcome::Ignored);
                }
                let entry = self.record(CheckpointRole::Resume, node_id, None, *timestamp)?;
                Ok(EventOutcome::Created {
                    entry,
                    replaced: None,
                })
            }
            ConversationEvent::UserTurnCompleted {
                node_id,
                text,
                timestamp,
                ..
            } => {
                if !self.tree_changed()? {
                    return Ok(EventOutcome::Unchanged);
                }
                let entry =
                    self.record(CheckpointRole::User, node_id, text.as_deref(), *timestamp)?;
                Ok(EventOutcome::Created {
                    entry,
                    replaced: None,
                })
            }
            ConversationEvent::AssistantTurnCompleted {
                node_id,
                text,
                timestamp,
                ..
            } => {
                if !self.tree_changed()? {
                    return Ok(EventOutcome::Unchanged);
                }
                self.replace_assistant(node_id, text.as_deref(), *timestamp)
            }
            ConversationEvent::ToolNodeProduced { .. } => Ok(EventOutcome::Ignored),
        }
    }

    /// Drop all in-memory state after the session's refs and rows are gone.
    /// The sequence counter keeps counting.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.timeline.clear();
        self.last_snapshot = None;
        self.restored.clear();
    }

    fn tree_changed(&self) -> Result<bool> {
        match &self.last_snapshot {
            None => Ok(true),
            Some(snapshot) => match self.store.has_changes_since(snapshot) {
                // Baseline commit was collected behind our back.
                Err(CairnError::SnapshotNotFound(r)) => {
                    warn!(target: "cairn::registry", "Baseline snapshot {} missing, treating tree as changed", r);
                    Ok(true)
                }
                other => other,
            },
        }
    }

    fn create_entry(
        &mut self,
        role: CheckpointRole,
        node_id: &NodeId,
        text: Option<&str>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<CheckpointEntry> {
        let sequence = self.next_sequence;
        let snapshot = self.store.create(&SnapshotLabel {
            role,
            sequence,
            node_id,
            created_at: Utc::now(),
        })?;
        self.next_sequence += 1;
        self.last_snapshot = Some(snapshot.clone());
        // Restored files are part of the recorded tree from here on.
        self.restored.clear();
        Ok(CheckpointEntry {
            node_id: node_id.clone(),
            role,
            sequence,
            snapshot,
            summary: NodeSummary::new(timestamp.unwrap_or_else(Utc::now), text),
        })
    }

    /// Persist `entry`, removing its ref again if the index rejects it.
    fn persist(&self, entry: &CheckpointEntry, replaced: Option<&CheckpointEntry>) -> Result<()> {
        if let Err(e) = self.index.insert_entry(&self.session_id, entry, replaced) {
            if let Err(cleanup) = self.store.delete(&entry.snapshot.ref_name) {
                warn!(target: "cairn::registry",
                    "Could not remove unindexed ref {}: {}", entry.snapshot.ref_name, cleanup);
            }
            return Err(e);
        }
        Ok(())
    }

    fn record(
        &mut self,
        role: CheckpointRole,
        node_id: &NodeId,
        text: Option<&str>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<CheckpointEntry> {
        let entry = self.create_entry(role, node_id, text, timestamp)?;
        self.persist(&entry, None)?;
        self.entries.insert(entry.sequence, entry.clone());
        self.timeline.push(entry.clone());
        self.save_cursor()?;
        info!(target: "cairn::registry",
            "Recorded {} checkpoint #{} for node {} in {}",
            role, entry.sequence, node_id, self.session_id);
        Ok(entry)
    }

    /// Create the new assistant checkpoint, then retire the previous one.
    fn replace_assistant(
        &mut self,
        node_id: &NodeId,
        text: Option<&str>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<EventOutcome> {
        let previous = self.assistant().cloned();
        let entry = self.create_entry(CheckpointRole::Assistant, node_id, text, timestamp)?;
        self.persist(&entry, previous.as_ref())?;

        self.entries.insert(entry.sequence, entry.clone());
        self.timeline.push(entry.clone());
        if let Some(old) = &previous {
            self.entries.remove(&old.sequence);
            self.timeline.remove(old.sequence);
            if let Err(e) = self.store.delete(&old.snapshot.ref_name) {
                warn!(target: "cairn::registry",
                    "Replaced assistant ref {} could not be deleted: {}", old.snapshot.ref_name, e);
            }
        }
        self.save_cursor()?;

        info!(target: "cairn::registry",
            "Recorded assistant checkpoint #{} for node {} in {}{}",
            entry.sequence,
            node_id,
            self.session_id,
            previous
                .as_ref()
                .map(|p| format!(" (replaced #{})", p.sequence))
                .unwrap_or_default());

        Ok(EventOutcome::Created {
            entry,
            replaced: previous,
        })
    }
}

/// Recreate entries from snapshot refs when the index has none.
fn rebuild_from_refs(
    session_id: &SessionId,
    store: &dyn SnapshotStore,
    index: &CheckpointIndex,
    records: Vec<SnapshotRecord>,
) -> Result<BTreeMap<u64, CheckpointEntry>> {
    let mut entries = BTreeMap::new();
    let mut have_resume = false;
    let latest_assistant = records
        .iter()
        .filter(|r| r.role == CheckpointRole::Assistant)
        .map(|r| r.sequence)
        .max();

    for record in records {
        let Some(node_id) = record.node_id.clone() else {
            warn!(target: "cairn::registry",
                "Ref {} has no node trailer, skipping", record.snapshot.ref_name);
            continue;
        };
        match record.role {
            CheckpointRole::Resume if have_resume => continue,
            CheckpointRole::Resume => have_resume = true,
            CheckpointRole::Assistant if Some(record.sequence) != latest_assistant => {
                delete_superseded(store, &record);
                continue;
            }
            _ => {}
        }
        let entry = CheckpointEntry {
            node_id,
            role: record.role,
            sequence: record.sequence,
            summary: NodeSummary::new(record.snapshot.created_at, None),
            snapshot: record.snapshot,
        };
        index.insert_entry(session_id, &entry, None)?;
        entries.insert(entry.sequence, entry);
    }
    Ok(entries)
}

/// Drop index rows whose ref is gone and report refs the index never saw.
fn prune_missing(
    session_id: &SessionId,
    store: &dyn SnapshotStore,
    index: &CheckpointIndex,
    entries: &mut BTreeMap<u64, CheckpointEntry>,
    records: &[SnapshotRecord],
) -> Result<()> {
    let live: HashSet<&str> = records
        .iter()
        .map(|r| r.snapshot.ref_name.as_str())
        .collect();
    let missing: Vec<u64> = entries
        .values()
        .filter(|e| !live.contains(e.snapshot.ref_name.as_str()))
        .map(|e| e.sequence)
        .collect();
    for sequence in missing {
        if let Some(entry) = entries.remove(&sequence) {
            warn!(target: "cairn::registry",
                "Pruning checkpoint #{} of {}: ref {} is gone", sequence, session_id, entry.snapshot.ref_name);
            index.delete_entry(session_id, sequence)?;
        }
    }

    let known: HashSet<&str> = entries
        .values()
        .map(|e| e.snapshot.ref_name.as_str())
        .collect();
    let live_assistant = entries
        .values()
        .find(|e| e.role == CheckpointRole::Assistant)
        .map(|e| e.sequence);
    for record in records.iter().filter(|r| !known.contains(r.snapshot.ref_name.as_str())) {
        match live_assistant {
            // Left behind by a replace whose ref delete failed.
            Some(live) if record.role == CheckpointRole::Assistant && record.sequence < live => {
                delete_superseded(store, record);
            }
            _ => warn!(target: "cairn::registry",
                "Ref {} in {} is not recorded in the checkpoint index; another writer may share this session",
                record.snapshot.ref_name, session_id),
        }
    }
    Ok(())
}

fn delete_superseded(store: &dyn SnapshotStore, record: &SnapshotRecord) {
    match store.delete(&record.snapshot.ref_name) {
        Ok(()) => info!(target: "cairn::registry",
            "Deleted superseded assistant ref {}", record.snapshot.ref_name),
        Err(e) => warn!(target: "cairn::registry",
            "Superseded assistant ref {} could not be deleted: {}", record.snapshot.ref_name, e),
    }
}
