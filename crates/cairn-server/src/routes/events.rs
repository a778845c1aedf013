//! Conversation event receiver.

use crate::routes::{bad_request, blocking, ApiResult};
use crate::state::AppState;
use axum::{extract::rejection::JsonRejection, extract::State, Json};
use cairn_types::{ConversationEvent, EventOutcome};
use std::sync::Arc;
use tracing::{debug, warn};

/// POST /api/events - Feed one conversation event to the checkpoint engine.
pub async fn receive(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ConversationEvent>, JsonRejection>,
) -> ApiResult<EventOutcome> {
    let Json(event) = payload.map_err(|rejection| {
        warn!(target: "cairn::events", "Rejected event: {}", rejection.body_text());
        bad_request("event", rejection.body_text())
    })?;
    debug!(
        target: "cairn::events",
        "Received {:?} for node {} in {}",
        event.node_kind(),
        event.node_id(),
        event.session_id()
    );

    let manager = state.manager.clone();
    blocking("event", move || manager.handle_event(&event)).await
}
