//! Relay server: rooms, WebSocket handling and the HTTP router.

pub mod rooms;
pub mod ws;

pub use rooms::{ConnectionId, RegistryStats, RelayError, RoomRegistry, RoomStats};

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub rooms: Arc<RoomRegistry>,
}

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Health check endpoint
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Room membership overview
async fn rooms(State(state): State<AppState>) -> Json<RegistryStats> {
    Json(state.rooms.stats().await)
}

/// Builds the relay router around a room registry.
pub fn app(rooms_registry: Arc<RoomRegistry>) -> Router {
    let state = AppState {
        rooms: rooms_registry,
    };

    Router::new()
        .route("/health", get(health))
        .route("/rooms", get(rooms))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
