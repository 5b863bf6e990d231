//! HTTP control surface
//!
//! Thin axum layer over the playback engine: status, switch commands, the
//! segment catalog and an SSE feed of player events.

pub mod handlers;
pub mod sse;

use axum::{
    extract::State,
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::catalog::SegmentCatalog;
use crate::playback::PlaybackHandle;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub handle: PlaybackHandle,
    pub catalog: Arc<SegmentCatalog>,
    /// Server port
    pub port: u16,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/playback/status", get(handlers::get_status))
        .route("/playback/command", post(handlers::post_command))
        .route("/catalog", get(handlers::get_catalog))
        .route("/events", get(sse::event_stream))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "module": "galleria-ap",
        "version": env!("CARGO_PKG_VERSION"),
        "port": state.port,
    }))
}
