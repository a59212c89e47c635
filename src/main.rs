//! OT Collab Server - real-time collaborative text editor
//!
//! A collaboration server using:
//! - Operational transformation with a central revision log per channel
//! - Sled embedded database for document snapshots
//! - Axum with WebSocket for real-time communication
//! - Binary and JSON protocols for sync messages

use anyhow::Context;
use std::sync::Arc;
use tracing::info;

use ot_collab::config::ServerConfig;
use ot_collab::storage::ChannelStore;
use ot_collab::sync::protocol::PROTOCOL_VERSION;
use ot_collab::sync::SyncServer;
use ot_collab::web::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "ot_collab=info,ot_collab_server=info,tower_http=info".into()
            }),
        )
        .init();

    let config = ServerConfig::from_env().context("Invalid configuration")?;

    info!("Initializing storage at: {}", config.storage.path);

    let storage = ChannelStore::open(config.storage.clone()).context("Failed to open storage")?;

    info!("Storage initialized successfully");

    let sync_server = Arc::new(SyncServer::new(storage, config.sync.clone()));
    let background = sync_server.clone().start_background_tasks();

    let state = Arc::new(AppState::new(sync_server.clone()));
    let app = web::router(state);

    let addr = config.socket_addr();

    info!("OT Collab server v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Protocol version: {}", PROTOCOL_VERSION);
    info!("   Listening on: http://{}", addr);
    info!("   WebSocket: ws://{}/ws/:channel_id", addr);
    info!("   Health check: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Stop background loops; the save loop writes dirty channels on the way out
    sync_server.shutdown();
    background.wait().await;
    sync_server
        .storage()
        .flush()
        .context("Failed to flush storage")?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
