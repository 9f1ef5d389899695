//! Entrypoint for the Doubao dialogue bridge.
//!
//! This binary is responsible for:
//! 1. Loading credentials and listener configuration from the environment.
//! 2. Initializing logging.
//! 3. Constructing the Axum router for the `/doubao-proxy` endpoint.
//! 4. Starting the web server and handling graceful shutdown.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use voicerelay_proxy::{config::DoubaoConfig, router::doubao_router};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = DoubaoConfig::from_env().context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();

    info!(
        bind_address = %config.bind_address,
        speaker = %config.speaker,
        "Doubao bridge configured. Starting server..."
    );
    let bind_address = config.bind_address;
    let app = doubao_router(Arc::new(config));
    let listener = tokio::net::TcpListener::bind(bind_address).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server has shut down.");
    Ok(())
}
