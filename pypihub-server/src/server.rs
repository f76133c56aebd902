//! HTTP server setup and routing.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::Config;
use crate::pypi;
use crate::state::AppState;

/// Build the router over an existing state.
pub fn router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.max_request_body_size_bytes();

    Router::new()
        .route("/health", get(health_handler))
        .route("/", post(pypi::upload_package))
        .route("/simple", get(|| async { simple_root_redirect() }))
        .route("/simple/", get(pypi::simple_index))
        .route("/simple/{package}", get(pypi::package_redirect))
        .route("/simple/{package}/", get(pypi::package_index))
        .route("/packages/{package}/{filename}", get(pypi::download_file))
        .route("/cache/{package}", delete(pypi::clear_cache))
        .route("/cache/{package}/", delete(pypi::clear_cache))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn simple_root_redirect() -> impl IntoResponse {
    (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, "/simple/")])
}

async fn health_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        r#"{"status": "healthy"}"#,
    )
}

/// Run the server until the process is stopped.
pub async fn run_server(host: String, port: u16, data_dir: PathBuf, config: Config) -> Result<()> {
    run_server_with_shutdown(host, port, data_dir, config, None).await
}

/// Run the server, stopping gracefully once `shutdown_receiver` fires.
pub async fn run_server_with_shutdown(
    host: String,
    port: u16,
    data_dir: PathBuf,
    config: Config,
    shutdown_receiver: Option<oneshot::Receiver<()>>,
) -> Result<()> {
    info!(
        host = %host,
        port = %port,
        data_dir = %data_dir.display(),
        upstream = %config.upstream.simple_url,
        ttl_secs = config.cache.ttl_secs,
        "Starting PyPIHub"
    );

    let state = AppState::from_config(config, data_dir)?;
    state
        .storage
        .init()
        .await
        .context("Failed to create storage directories")?;
    let app = router(Arc::new(state));

    let addr: SocketAddr = format!("{host}:{port}").parse().map_err(|e| {
        error!(host = %host, port = %port, error = %e, "Invalid socket address");
        anyhow::anyhow!("Invalid socket address {host}:{port}: {e}")
    })?;
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    info!("Server listening on {}", addr);

    match shutdown_receiver {
        Some(shutdown_rx) => {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                    info!("Received shutdown signal, stopping gracefully");
                })
                .await
                .context("Server error")?;
        }
        None => {
            axum::serve(listener, app).await.context("Server error")?;
        }
    }

    Ok(())
}
