//! Shared application state.

use crate::config::Config;
use cairn_core::{CheckpointManager, TreePosition};
use cairn_types::{NodeId, SessionId};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Conversation-tree positions set by restores, per session.
///
/// Stands in for the conversation component's own pointer: clients read it
/// back after an undo, redo or positional jump.
#[derive(Debug, Default)]
pub struct SessionPositions {
    positions: DashMap<SessionId, NodeId>,
}

impl SessionPositions {
    pub fn get(&self, session_id: &SessionId) -> Option<NodeId> {
        self.positions.get(session_id).map(|n| n.clone())
    }
}

impl TreePosition for SessionPositions {
    fn set_tree_position(&self, session_id: &SessionId, node_id: &NodeId) {
        debug!(target: "cairn::api", "Tree position of {} is now {}", session_id, node_id);
        self.positions.insert(session_id.clone(), node_id.clone());
    }
}

/// Shared application state.
pub struct AppState {
    pub manager: Arc<CheckpointManager>,
    pub positions: Arc<SessionPositions>,
}

impl AppState {
    pub fn new(config: &Config) -> cairn_core::Result<Self> {
        let positions = Arc::new(SessionPositions::default());
        let manager = Arc::new(CheckpointManager::new(
            config.manager_config(),
            positions.clone(),
        )?);

        Ok(Self { manager, positions })
    }
}
