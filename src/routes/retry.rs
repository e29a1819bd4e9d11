use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;

use crate::app_state::AppState;
use crate::models::request::{ErrorResponse, RetryRequest, RetryResponse};
use crate::models::row::RowTask;
use crate::services::emitter::JobLogger;
use crate::services::invoker::RetryableInvoker;

/// POST /api/retry: analyse one text synchronously with a small retry budget.
pub async fn retry_row(
    State(state): State<AppState>,
    Json(req): Json<RetryRequest>,
) -> Result<Json<RetryResponse>, (StatusCode, Json<ErrorResponse>)> {
    req.validate().map_err(|report| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "缺少文本内容".to_string(),
                details: Some(report.to_string()),
            }),
        )
    })?;

    let invoker =
        RetryableInvoker::new(state.llm.clone(), state.retry_policy, JobLogger::tracing_only())
            .with_prompts(req.system_prompt, req.user_prompt)
        .with_temperature(state.temperature);
    let invocation = invoker.run_detailed(RowTask::new(0, req.text)).await;

    match invocation.raw_response {
        Some(raw_response) => Ok(Json(RetryResponse {
            success: true,
            diseases: invocation.result.diseases,
            raw_response,
        })),
        None => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: format!("重试失败（已尝试 {} 次）", state.retry_policy.max_retries + 1),
                details: invocation.result.error_label(),
            }),
        )),
    }
}
