use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::middleware::from_fn;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::config::Config;
use crate::middleware::{log_requests, request_id};
use crate::routes;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let cors = if state.enable_cors {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
    };

    // Layers run outside-in from the bottom: request_id first so the logger sees it.
    Router::new()
        .route("/", get(routes::health))
        .route("/extract-embedding", post(routes::extract_embedding))
        .route("/compare-embedding", post(routes::compare_embedding))
        .fallback(routes::not_found)
        .layer(DefaultBodyLimit::max(state.max_upload_bytes))
        .layer(cors)
        .layer(from_fn(log_requests))
        .layer(from_fn(request_id))
        .with_state(state)
}

/// Bind `config.bind` and serve until Ctrl+C or SIGTERM.
pub async fn serve(config: &Config, state: AppState) -> Result<()> {
    let addr = config.socket_addr()?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    log::info!("listening on {}", addr);
    log::info!(
        "default threshold {}, extraction budget {}s, max upload {}MB",
        config.threshold,
        config.extract_timeout_secs,
        config.max_upload_mb
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving http")?;

    log::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            log::error!("failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                log::error!("failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log::info!("received Ctrl+C, shutting down"),
        _ = terminate => log::info!("received SIGTERM, shutting down"),
    }
}
