//! Entrypoint for the GLM pass-through bridge.
//!
//! Mirrors the Doubao binary: environment configuration, logging, one
//! WebSocket route on `/proxy`, graceful shutdown.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use voicerelay_proxy::{config::GlmConfig, router::glm_router};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = GlmConfig::from_env().context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();

    info!(
        bind_address = %config.bind_address,
        "GLM bridge configured. Starting server..."
    );
    let bind_address = config.bind_address;
    let app = glm_router(Arc::new(config));
    let listener = tokio::net::TcpListener::bind(bind_address).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server has shut down.");
    Ok(())
}
