pub mod analyze;
pub mod health;
pub mod jobs;
pub mod metrics;
pub mod retry;
pub mod validate_key;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;

/// API routes without the metrics endpoint, which needs the global recorder.
pub fn router(state: AppState, max_body_bytes: usize) -> Router {
    // Downloads are compressed; the live NDJSON stream is not, so frames
    // reach the client as soon as they are written.
    let downloads = Router::new()
        .route("/api/logs/{job_id}", get(jobs::download_log))
        .route("/api/exports/{file}", get(jobs::download_export))
        .layer(CompressionLayer::new());

    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/analyze", post(analyze::analyze))
        .route("/api/retry", post(retry::retry_row))
        .route("/api/validate-key", post(validate_key::validate_key))
        .route("/api/jobs/{job_id}/abort", post(jobs::abort_job))
        .merge(downloads)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
}
