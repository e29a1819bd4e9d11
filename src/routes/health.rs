use std::path::Path;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub running_jobs: usize,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub logs_dir: ComponentHealth,
    pub checkpoints_dir: ComponentHealth,
    pub exports_dir: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

/// GET /health: liveness plus writability of the data directories.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let checks = HealthChecks {
        logs_dir: check_writable(&state.paths.logs_dir).await,
        checkpoints_dir: check_writable(&state.paths.checkpoints_dir).await,
        exports_dir: check_writable(&state.paths.exports_dir).await,
    };

    let all_healthy = [&checks.logs_dir, &checks.checkpoints_dir, &checks.exports_dir]
        .iter()
        .all(|c| c.status == "ok");
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        running_jobs: state.jobs.registry().len(),
        checks,
    };

    (status_code, Json(response))
}

async fn check_writable(dir: &Path) -> ComponentHealth {
    let start = std::time::Instant::now();
    let marker = dir.join(".health");
    let result = async {
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(&marker, b"ok").await?;
        tokio::fs::remove_file(&marker).await
    }
    .await;

    match result {
        Ok(()) => ComponentHealth {
            status: "ok".to_string(),
            latency_ms: Some(start.elapsed().as_millis() as u64),
        },
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "Data directory not writable");
            ComponentHealth {
                status: "error".to_string(),
                latency_ms: None,
            }
        }
    }
}
