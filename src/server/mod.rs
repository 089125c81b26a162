//! HTTP surface over the [`JobManager`](crate::jobs::JobManager).

pub mod api;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::jobs::JobManager;
pub use api::{ApiError, AppState, SharedState, api_router};

/// Configuration for the HTTP server.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Permissive CORS for local front-end development
    pub dev_mode: bool,
    /// Recover orphaned jobs before accepting requests
    pub resume_on_start: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3150,
            dev_mode: false,
            resume_on_start: true,
        }
    }
}

/// Build the application router.
pub fn build_router(state: SharedState) -> Router {
    api_router()
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the server and run until Ctrl+C.
pub async fn start_server(manager: JobManager, config: ServerConfig) -> Result<()> {
    if config.resume_on_start {
        match manager.recover_orphans().await {
            Ok(report)
                if !report.resumed.is_empty()
                    || !report.failed.is_empty()
                    || !report.skipped.is_empty() =>
            {
                info!(
                    resumed = ?report.resumed,
                    failed = ?report.failed,
                    cancelled = ?report.cancelled,
                    skipped = ?report.skipped,
                    "Recovered orphaned jobs"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Orphan recovery failed"),
        }
    }

    let mut app = build_router(Arc::new(AppState { manager }));
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(%local_addr, "Dossier server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
