//! Undo/redo timeline over a session's checkpoints.
//!
//! Holds user and assistant entries in sequence order with a cursor that is
//! either on an entry or before the first one. Resume entries never enter
//! the timeline.

use cairn_types::{CheckpointEntry, TimelineItem};
use thiserror::Error;
use tracing::trace;

/// Boundary reached while stepping through the timeline.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineBoundary {
    #[error("No earlier checkpoint")]
    NoEarlierEntry,
    #[error("No later checkpoint")]
    NoLaterEntry,
}

#[derive(Debug, Clone, Default)]
pub struct Timeline {
    entries: Vec<CheckpointEntry>,
    cursor: Option<usize>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a timeline from stored entries, placing the cursor on
    /// `cursor_sequence` when it names one of them.
    pub fn from_entries(
        entries: impl IntoIterator<Item = CheckpointEntry>,
        cursor_sequence: Option<u64>,
    ) -> Self {
        let mut entries: Vec<_> = entries
            .into_iter()
            .filter(|e| e.role.on_timeline())
            .collect();
        entries.sort_by_key(|e| e.sequence);
        let mut timeline = Self {
            entries,
            cursor: None,
        };
        timeline.reposition(cursor_sequence);
        timeline
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn current(&self) -> Option<&CheckpointEntry> {
        self.cursor.and_then(|i| self.entries.get(i))
    }

    /// Sequence of the entry under the cursor, `None` when before the first.
    pub fn cursor_sequence(&self) -> Option<u64> {
        self.current().map(|e| e.sequence)
    }

    /// Step one entry toward the session start.
    pub fn back(&mut self) -> Result<&CheckpointEntry, TimelineBoundary> {
        match self.cursor {
            Some(i) if i > 0 => {
                self.cursor = Some(i - 1);
                trace!(target: "cairn::timeline", "Cursor moved back to {}", i - 1);
                Ok(&self.entries[i - 1])
            }
            _ => Err(TimelineBoundary::NoEarlierEntry),
        }
    }

    /// Step one entry toward the newest checkpoint.
    pub fn forward(&mut self) -> Result<&CheckpointEntry, TimelineBoundary> {
        let next = self.cursor.map_or(0, |i| i + 1);
        if next >= self.entries.len() {
            return Err(TimelineBoundary::NoLaterEntry);
        }
        self.cursor = Some(next);
        trace!(target: "cairn::timeline", "Cursor moved forward to {}", next);
        Ok(&self.entries[next])
    }

    /// Insert an entry in sequence order and move the cursor onto it.
    pub fn push(&mut self, entry: CheckpointEntry) {
        if !entry.role.on_timeline() {
            return;
        }
        let at = self.entries.partition_point(|e| e.sequence < entry.sequence);
        self.entries.insert(at, entry);
        self.cursor = Some(at);
    }

    /// Remove the entry with `sequence`. A cursor on the removed entry moves
    /// to the preceding one.
    pub fn remove(&mut self, sequence: u64) -> Option<CheckpointEntry> {
        let at = self.entries.iter().position(|e| e.sequence == sequence)?;
        let removed = self.entries.remove(at);
        self.cursor = match self.cursor {
            Some(c) if c > at => Some(c - 1),
            Some(c) if c == at => at.checked_sub(1),
            other => other,
        };
        Some(removed)
    }

    /// Put the cursor on the entry with `sequence`. Returns false (cursor
    /// unchanged) when no such entry exists.
    pub fn seek(&mut self, sequence: u64) -> bool {
        match self.entries.iter().position(|e| e.sequence == sequence) {
            Some(at) => {
                self.cursor = Some(at);
                true
            }
            None => false,
        }
    }

    /// Restore a cursor previously read with [`Self::cursor_sequence`].
    pub fn reposition(&mut self, sequence: Option<u64>) {
        match sequence {
            Some(seq) if self.seek(seq) => {}
            _ => self.cursor = None,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.cursor = None;
    }

    /// Display rows in creation order. Each call starts a fresh iteration.
    pub fn list(&self) -> impl Iterator<Item = TimelineItem> + '_ {
        self.entries
            .iter()
            .enumerate()
            .map(move |(i, e)| TimelineItem::from_entry(e, Some(i) == self.cursor))
    }
}
