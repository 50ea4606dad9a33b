//! # parley-server
//!
//! HTTP front of the communication store.
//!
//! This binary provides:
//! - **Transactions**: events posted per workspace are validated, applied
//!   and broadcast to subscribed sessions
//! - **Find requests** for messages, groups, notification contexts,
//!   notifications and collaborators
//! - **Server-sent broadcast streams** per session
//! - **Archive blob storage** on the local filesystem, with a periodic
//!   sweep of unreferenced blobs

mod api;
mod blob_store;
mod config;
mod error;
mod workspaces;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_server=debug")),
        )
        .init();

    info!("Starting Parley server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    tokio::fs::create_dir_all(&config.data_dir).await?;
    tokio::fs::create_dir_all(&config.blob_storage_path).await?;

    let http_addr = config.http_addr;
    let app_state = AppState::new(Arc::new(config));

    // -----------------------------------------------------------------------
    // 3. Spawn background tasks
    // -----------------------------------------------------------------------
    if let Some(every) = app_state.config.orphan_sweep_interval {
        blob_store::spawn_sweeper(
            app_state.workspaces.clone(),
            every,
            app_state.config.orphan_grace,
        );
        info!(every_secs = every.as_secs(), "Orphan blob sweep scheduled");
    }

    // -----------------------------------------------------------------------
    // 4. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
