//! Read-only HTTP endpoints.
//!
//! - GET /health       : liveness check
//! - GET /api/presence : current presence snapshot

use axum::{Json, extract::State, http::StatusCode};
use std::sync::Arc;
use tracing::error;

use crate::presence;
use crate::protocol::PresenceSnapshot;
use crate::relay::RelayState;

pub async fn health() -> &'static str {
    "ok"
}

/// GET /api/presence: the same snapshot clients receive as `online_users`.
pub async fn presence(State(state): State<Arc<RelayState>>) -> Result<Json<PresenceSnapshot>, StatusCode> {
    presence::snapshot(&state.hub, state.store.as_ref())
        .await
        .map(Json)
        .map_err(|e| {
            error!("Presence snapshot failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })
}
