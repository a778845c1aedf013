//! Timeline queries and restore operations for one session.

use crate::routes::{blocking, parse_session, ApiResult};
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use cairn_types::{
    ClearReport, ForkMode, ForkOutcome, JumpChoice, JumpOutcome, NavigationOutcome, NodeId,
    SessionId, TimelineItem,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

#[derive(Serialize)]
pub struct TimelineResponse {
    pub session_id: SessionId,
    pub entries: Vec<TimelineItem>,
}

pub async fn timeline(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<TimelineResponse> {
    let session_id = parse_session("timeline", &id)?;
    let manager = state.manager.clone();
    blocking("timeline", move || {
        let entries = manager.list_timeline(&session_id)?;
        Ok(TimelineResponse {
            session_id,
            entries,
        })
    })
    .await
}

#[derive(Serialize)]
pub struct HasSnapshotResponse {
    pub node_id: NodeId,
    pub has_snapshot: bool,
}

pub async fn has_snapshot(
    State(state): State<Arc<AppState>>,
    Path((id, node)): Path<(String, String)>,
) -> ApiResult<HasSnapshotResponse> {
    let session_id = parse_session("has_snapshot", &id)?;
    let node_id = NodeId::new(node);
    let manager = state.manager.clone();
    blocking("has_snapshot", move || {
        let has_snapshot = manager.has_snapshot(&session_id, &node_id)?;
        Ok(HasSnapshotResponse {
            node_id,
            has_snapshot,
        })
    })
    .await
}

#[derive(Deserialize)]
pub struct JumpRequest {
    pub node_id: NodeId,
    pub choice: JumpChoice,
}

pub async fn jump(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<JumpRequest>,
) -> ApiResult<JumpOutcome> {
    let session_id = parse_session("tree_jump", &id)?;
    info!(target: "cairn::api", "Tree jump in {} to {} ({:?})", session_id, req.node_id, req.choice);
    let manager = state.manager.clone();
    blocking("tree_jump", move || {
        manager.tree_jump(&session_id, &req.node_id, req.choice)
    })
    .await
}

pub async fn undo(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<NavigationOutcome> {
    let session_id = parse_session("undo", &id)?;
    let manager = state.manager.clone();
    blocking("undo", move || manager.undo(&session_id)).await
}

pub async fn redo(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<NavigationOutcome> {
    let session_id = parse_session("redo", &id)?;
    let manager = state.manager.clone();
    blocking("redo", move || manager.redo(&session_id)).await
}

#[derive(Deserialize)]
pub struct ForkRequest {
    pub node_id: NodeId,
    pub mode: ForkMode,
}

pub async fn fork(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ForkRequest>,
) -> ApiResult<ForkOutcome> {
    let session_id = parse_session("fork", &id)?;
    info!(target: "cairn::api", "Fork of {} at {} ({:?})", session_id, req.node_id, req.mode);
    let manager = state.manager.clone();
    blocking("fork", move || manager.fork(&session_id, &req.node_id, req.mode)).await
}

pub async fn clear(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<ClearReport> {
    let session_id = parse_session("clear", &id)?;
    info!(target: "cairn::api", "Clearing checkpoints of {}", session_id);
    let manager = state.manager.clone();
    blocking("clear", move || manager.clear(&session_id)).await
}

#[derive(Serialize)]
pub struct PositionResponse {
    pub session_id: SessionId,
    /// Last node a restore moved the conversation tree to.
    pub node_id: Option<NodeId>,
}

pub async fn position(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<PositionResponse> {
    let session_id = parse_session("position", &id)?;
    let node_id = state.positions.get(&session_id);
    Ok(Json(PositionResponse {
        session_id,
        node_id,
    }))
}
