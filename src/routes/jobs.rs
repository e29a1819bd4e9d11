use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::app_state::AppState;
use crate::models::request::{AbortResponse, ErrorResponse};

/// POST /api/jobs/{job_id}/abort: cancel a running job. It stops after its
/// current group and ends with an `INTERRUPTED` error event.
pub async fn abort_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<AbortResponse>, (StatusCode, Json<ErrorResponse>)> {
    if !state.jobs.registry().cancel(&job_id) {
        return Err(not_found(format!("job {} is not running", job_id)));
    }
    tracing::info!(job_id = %job_id, "Abort requested");
    Ok(Json(AbortResponse {
        job_id,
        status: "aborting".to_string(),
    }))
}

/// GET /api/logs/{job_id}: the job's JSON-lines log file.
pub async fn download_log(State(state): State<AppState>, Path(job_id): Path<String>) -> Response {
    if !is_safe_job_id(&job_id) {
        return bad_request("invalid job id");
    }
    let path = state.paths.log_file(&job_id);
    match tokio::fs::read(&path).await {
        Ok(content) => {
            attachment("application/x-ndjson", &format!("analysis-{}.log", job_id), content)
        }
        Err(_) => not_found(format!("no log for job {}", job_id)).into_response(),
    }
}

/// GET /api/exports/{file}: one CSV batch export.
pub async fn download_export(State(state): State<AppState>, Path(file): Path<String>) -> Response {
    let path = match state.exporter.resolve(&file) {
        Ok(path) => path,
        Err(e) => return bad_request(&e.to_string()),
    };
    match tokio::fs::read(&path).await {
        Ok(content) => attachment("text/csv; charset=utf-8", &file, content),
        Err(_) => not_found(format!("export {} not found", file)).into_response(),
    }
}

fn is_safe_job_id(job_id: &str) -> bool {
    !job_id.is_empty()
        && job_id.len() <= 64
        && job_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn attachment(content_type: &'static str, file_name: &str, content: Vec<u8>) -> Response {
    (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{}\"", file_name)),
        ],
        Body::from(content),
    )
        .into_response()
}

fn not_found(error: String) -> (StatusCode, Json<ErrorResponse>) {
    (StatusCode::NOT_FOUND, Json(ErrorResponse { error, details: None }))
}

fn bad_request(error: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: error.to_string(),
            details: None,
        }),
    )
        .into_response()
}
