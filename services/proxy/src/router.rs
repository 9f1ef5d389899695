//! Axum Router Configuration
//!
//! Each bridge exposes exactly one WebSocket route; every other path falls
//! through to axum's default 404 response.

use std::sync::Arc;

use axum::{Router, routing::get};

use crate::config::{DoubaoConfig, GlmConfig};
use crate::ws;

/// Creates the router for the Doubao dialogue bridge.
pub fn doubao_router(config: Arc<DoubaoConfig>) -> Router {
    Router::new()
        .route("/doubao-proxy", get(ws::doubao::ws_handler))
        .with_state(config)
}

/// Creates the router for the GLM pass-through bridge.
pub fn glm_router(config: Arc<GlmConfig>) -> Router {
    Router::new()
        .route("/proxy", get(ws::glm::ws_handler))
        .with_state(config)
}
