//! Snapshot and checkpoint types.
//!
//! A [`Snapshot`] is an immutable capture of the working tree held by the
//! version-control backend. A [`CheckpointEntry`] binds a conversation node
//! to a snapshot with a [`CheckpointRole`].

use crate::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Common prefix of every snapshot ref name.
pub const REF_NAME_PREFIX: &str = "checkpoint-";

/// Maximum excerpt length (in characters) kept for timeline display.
pub const EXCERPT_MAX_CHARS: usize = 80;

/// Role of a checkpoint entry within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointRole {
    /// Taken once at session start; only reachable through fork fallback.
    Resume,
    /// Taken after a user turn that changed the working tree.
    User,
    /// Latest assistant turn; replaced by each newer assistant checkpoint.
    Assistant,
}

impl CheckpointRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resume => "resume",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    /// Whether entries of this role participate in undo/redo.
    pub fn on_timeline(&self) -> bool {
        !matches!(self, Self::Resume)
    }

    /// Ref name for a snapshot of this role.
    ///
    /// `checkpoint-resume-<token>`, `checkpoint-<token>` for user turns,
    /// `checkpoint-assistant-<token>`, where the token is the zero-padded
    /// sequence followed by the creation time in unix milliseconds.
    pub fn ref_name(&self, sequence: u64, created_at: DateTime<Utc>) -> String {
        let token = format!("{:06}-{}", sequence, created_at.timestamp_millis());
        match self {
            Self::User => format!("{REF_NAME_PREFIX}{token}"),
            Self::Resume | Self::Assistant => {
                format!("{REF_NAME_PREFIX}{}-{token}", self.as_str())
            }
        }
    }
}

impl fmt::Display for CheckpointRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "resume" => Ok(Self::Resume),
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(format!("unknown checkpoint role: {other}")),
        }
    }
}

/// Role and sequence recovered from a snapshot ref name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefToken {
    pub role: CheckpointRole,
    pub sequence: u64,
    pub created_millis: i64,
}

impl RefToken {
    /// Parse a short ref name produced by [`CheckpointRole::ref_name`].
    pub fn parse(ref_name: &str) -> Option<Self> {
        let rest = ref_name.strip_prefix(REF_NAME_PREFIX)?;
        let (role, token) = if let Some(token) = rest.strip_prefix("resume-") {
            (CheckpointRole::Resume, token)
        } else if let Some(token) = rest.strip_prefix("assistant-") {
            (CheckpointRole::Assistant, token)
        } else {
            (CheckpointRole::User, rest)
        };
        let (sequence, millis) = token.split_once('-')?;
        Some(Self {
            role,
            sequence: sequence.parse().ok()?,
            created_millis: millis.parse().ok()?,
        })
    }
}

/// An immutable capture of the full working-tree state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Short ref name inside the session namespace.
    pub ref_name: String,
    /// Hex id of the backend object holding the tree state.
    pub object_id: String,
    pub created_at: DateTime<Utc>,
}

/// Display summary of the node a checkpoint is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub timestamp: DateTime<Utc>,
    pub excerpt: String,
}

impl NodeSummary {
    pub fn new(timestamp: DateTime<Utc>, text: Option<&str>) -> Self {
        Self {
            timestamp,
            excerpt: text.map(excerpt).unwrap_or_default(),
        }
    }
}

/// Collapse whitespace and cut `text` to [`EXCERPT_MAX_CHARS`] characters.
pub fn excerpt(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= EXCERPT_MAX_CHARS {
        return collapsed;
    }
    let mut cut: String = collapsed.chars().take(EXCERPT_MAX_CHARS - 1).collect();
    cut.push('…');
    cut
}

/// Binding between a conversation node and a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub node_id: NodeId,
    pub role: CheckpointRole,
    /// Creation order within the session. Authoritative for ordering.
    pub sequence: u64,
    pub snapshot: Snapshot,
    pub summary: NodeSummary,
}

/// A timeline row as shown by a numbered picker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineItem {
    pub node_id: NodeId,
    pub role: CheckpointRole,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub excerpt: String,
    pub is_current: bool,
}

impl TimelineItem {
    pub fn from_entry(entry: &CheckpointEntry, is_current: bool) -> Self {
        Self {
            node_id: entry.node_id.clone(),
            role: entry.role,
            sequence: entry.sequence,
            timestamp: entry.summary.timestamp,
            excerpt: entry.summary.excerpt.clone(),
            is_current,
        }
    }
}
