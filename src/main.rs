//! rover-link server entry point.
//!
//! Starts the Axum HTTP server with the REST API and the rover link
//! WebSocket endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use rover_link::api;
use rover_link::app_state::AppState;
use rover_link::config::{ServerConfig, StorageBackend};
use rover_link::server::run_liveness_sweep;
use rover_link::storage::{MemoryStorage, PostgresStorage, Storage};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env()?;
    tracing::info!(
        addr = %config.listen_addr,
        storage = ?config.storage_backend,
        "starting rover-link"
    );

    let storage: Arc<dyn Storage> = match config.storage_backend {
        StorageBackend::Memory => Arc::new(MemoryStorage::new()),
        StorageBackend::Postgres => Arc::new(PostgresStorage::connect(&config.database).await?),
    };

    let app_state = AppState::new(storage, config.outbound_queue_capacity);

    if let Some(timeout) = config.session_timeout {
        tokio::spawn(run_liveness_sweep(Arc::clone(&app_state.registry), timeout));
    }

    let app = api::build_app(app_state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    })
    .await?;

    Ok(())
}
