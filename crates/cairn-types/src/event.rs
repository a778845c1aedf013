//! Conversation events consumed by the checkpoint engine.
//!
//! The conversation/session component emits one event per node it produces.
//! The set is closed: every consumer matches it exhaustively.

use crate::{NodeId, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Kind of a node in the conversation tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    SessionStart,
    User,
    Assistant,
    Tool,
}

/// An event from the conversation/session component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConversationEvent {
    /// First event of a session. `project_dir` selects the repository to
    /// snapshot; the engine's configured default is used when absent.
    SessionStart {
        session_id: SessionId,
        node_id: NodeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project_dir: Option<PathBuf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
    /// A user turn has been fully recorded.
    UserTurnCompleted {
        session_id: SessionId,
        node_id: NodeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
    /// The assistant finished its turn (including all tool calls).
    AssistantTurnCompleted {
        session_id: SessionId,
        node_id: NodeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
    /// A tool call/result node. Never checkpointed.
    ToolNodeProduced {
        session_id: SessionId,
        node_id: NodeId,
    },
}

impl ConversationEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::SessionStart { session_id, .. }
            | Self::UserTurnCompleted { session_id, .. }
            | Self::AssistantTurnCompleted { session_id, .. }
            | Self::ToolNodeProduced { session_id, .. } => session_id,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        match self {
            Self::SessionStart { node_id, .. }
            | Self::UserTurnCompleted { node_id, .. }
            | Self::AssistantTurnCompleted { node_id, .. }
            | Self::ToolNodeProduced { node_id, .. } => node_id,
        }
    }

    pub fn node_kind(&self) -> NodeKind {
        match self {
            Self::SessionStart { .. } => NodeKind::SessionStart,
            Self::UserTurnCompleted { .. } => NodeKind::User,
            Self::AssistantTurnCompleted { .. } => NodeKind::Assistant,
            Self::ToolNodeProduced { .. } => NodeKind::Tool,
        }
    }
}
