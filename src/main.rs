//! Chat relay server.
//!
//! Serves the WebSocket relay on `/ws` plus a small read-only HTTP API.
//! Configuration comes from `RELAY_*` environment variables.

use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use chat_relay::config::RelayConfig;
use chat_relay::relay::RelayState;
use chat_relay::storage::SqliteStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = RelayConfig::from_env();

    if let Some(dir) = config.db_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    let store = Arc::new(SqliteStore::open(&config.db_path)?);
    let state = Arc::new(RelayState::open(store)?);

    let app = chat_relay::app(state, chat_relay::cors_layer(config.cors_origin.as_deref()));

    let listener = tokio::net::TcpListener::bind(&config.addr).await?;
    tracing::info!("Chat relay listening on {}", config.addr);
    tracing::info!("WebSocket:  ws://{}/ws", config.addr);
    tracing::info!("Presence:   http://{}/api/presence", config.addr);

    axum::serve(listener, app).await?;
    Ok(())
}
