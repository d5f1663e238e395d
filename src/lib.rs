//! Presence and message-routing relay for multi-user chat.
//!
//! Clients hold one WebSocket each, bind a user id with `register`, and then
//! exchange chat messages, presence snapshots and friend-request events as
//! JSON frames. Durable data lives in SQLite; connection state is in memory.

pub mod api;
pub mod config;
pub mod error;
pub mod friends;
pub mod hub;
pub mod model;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod rooms;
pub mod router;
pub mod storage;

use axum::{
    Router,
    extract::{State, ws::WebSocketUpgrade},
    http::HeaderValue,
    response::IntoResponse,
    routing::get,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use relay::RelayState;

/// HTTP and WebSocket routes.
pub fn app(state: Arc<RelayState>, cors: CorsLayer) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(api::health))
        .route("/api/presence", get(api::presence))
        .layer(cors)
        .with_state(state)
}

/// Restrict CORS to `origin`, or allow any origin when none is configured.
pub fn cors_layer(origin: Option<&str>) -> CorsLayer {
    let Some(origin) = origin else {
        return CorsLayer::permissive();
    };
    match HeaderValue::from_str(origin) {
        Ok(value) => CorsLayer::new()
            .allow_origin(value)
            .allow_methods(Any)
            .allow_headers(Any),
        Err(e) => {
            warn!("Ignoring invalid RELAY_CORS_ORIGIN {origin:?}: {e}");
            CorsLayer::permissive()
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| relay::handle_connection(socket, state))
}
