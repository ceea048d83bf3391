//! HTTP surface: upload intake, scan control and status endpoints.

pub mod auth;
pub mod error;
pub mod scans;
pub mod uploads;

pub use error::{ApiError, ApiResult};

use crate::config::Config;
use crate::metrics::Metrics;
use crate::scan::{ScanQueue, ScanRecorder};
use crate::uploads::Assembler;
use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, FromRequest},
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{limit::RequestBodyLimitLayer, timeout::TimeoutLayer};
use tracing::info;

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub assembler: Arc<Assembler>,
    pub recorder: Arc<ScanRecorder>,
    pub queue: ScanQueue,
    pub metrics: Metrics,
    pub config: Arc<Config>,
}

/// `Json` whose rejections render as [`ApiError`] bodies.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

pub fn router(state: AppState) -> Router {
    let max_body_bytes = state.config.server.max_body_bytes;
    let request_timeout = Duration::from_secs(state.config.server.request_timeout_secs);
    let protected = Router::new()
        .route("/files/upload", post(uploads::direct_upload))
        .route("/files/upload/init", post(uploads::init))
        .route("/files/upload/chunk", post(uploads::chunk))
        .route("/files/upload/finalize", post(uploads::finalize))
        .route("/files/upload/abort", post(uploads::abort))
        .route("/files/status/{id}", get(uploads::status))
        .route("/scans/process", post(scans::process))
        .route("/scans/batch", post(scans::batch))
        .route("/scans/retry", post(scans::retry))
        .route("/scans/latest", get(scans::latest))
        .route("/scans/{id}/suggestions", get(scans::suggestions))
        .route("/scans/{id}/status", get(scans::status))
        .route("/metrics", get(scans::metrics))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ));

    Router::new()
        .route("/health", get(scans::health))
        .merge(protected)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TimeoutLayer::new(request_timeout))
        .with_state(state)
}

/// Bind and serve until `shutdown` fires.
pub async fn serve(state: AppState, shutdown: CancellationToken) -> Result<()> {
    let bind = state.config.server.bind.clone();
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    info!(address = %bind, "Gateway listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Gateway server failed")
}
