use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use garde::Validate;

use crate::app_state::AppState;
use crate::models::request::{AnalyzeRequest, ErrorResponse};
use crate::services::emitter::ndjson_frames;
use crate::services::job::JobRequest;

/// POST /api/analyze: start or resume a job and stream its events as NDJSON.
pub async fn analyze(State(state): State<AppState>, Json(req): Json<AnalyzeRequest>) -> Response {
    if let Err(report) = req.validate() {
        return bad_request("invalid request", Some(report.to_string()));
    }

    let request = match JobRequest::try_from(req) {
        Ok(request) => request,
        Err(e) => return bad_request(e.error_type(), Some(e.to_string())),
    };

    let events = state.jobs.spawn(request);
    (
        [
            (header::CONTENT_TYPE, "application/x-ndjson"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(ndjson_frames(events)),
    )
        .into_response()
}

fn bad_request(error: &str, details: Option<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: error.to_string(),
            details,
        }),
    )
        .into_response()
}
