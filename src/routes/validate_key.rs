use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;

use crate::app_state::AppState;
use crate::models::request::{ValidateKeyRequest, ValidateKeyResponse};
use crate::services::providers::provider_info;

/// Keys shorter than this are almost certainly truncated copies.
const MIN_API_KEY_LEN: usize = 20;

/// POST /api/validate-key: check a user-supplied key against its provider.
pub async fn validate_key(
    State(state): State<AppState>,
    Json(req): Json<ValidateKeyRequest>,
) -> (StatusCode, Json<ValidateKeyResponse>) {
    if req.api_key.is_empty() {
        return failure(StatusCode::BAD_REQUEST, "API Key 不能为空");
    }
    if req.api_key.chars().count() < MIN_API_KEY_LEN {
        return failure(StatusCode::BAD_REQUEST, "API Key 长度太短，请检查是否正确复制");
    }

    if let Err(report) = req.validate() {
        return failure(StatusCode::BAD_REQUEST, format!("验证失败: {}", report));
    }

    let model_id = req.model_id.unwrap_or_else(|| state.default_model_id.to_string());
    let provider_id = model_id.split('/').next().unwrap_or_default();
    let Some(provider) = provider_info(provider_id) else {
        return failure(StatusCode::BAD_REQUEST, format!("不支持的模型提供商: {}", provider_id));
    };

    let client = match (state.llm_factory)(&model_id, &req.api_key) {
        Ok(client) => client,
        Err(e) => return failure(StatusCode::BAD_REQUEST, format!("验证失败: {}", e)),
    };

    if client.validate().await {
        tracing::info!(provider = provider.id, model = %model_id, "API key validated");
        (
            StatusCode::OK,
            Json(ValidateKeyResponse {
                success: true,
                message: "API Key 验证成功".to_string(),
                provider: Some(provider.name.to_string()),
                model: Some(model_id),
            }),
        )
    } else {
        failure(StatusCode::UNAUTHORIZED, "API Key 无效，请检查")
    }
}

fn failure(
    status: StatusCode,
    message: impl Into<String>,
) -> (StatusCode, Json<ValidateKeyResponse>) {
    (
        status,
        Json(ValidateKeyResponse {
            success: false,
            message: message.into(),
            provider: None,
            model: None,
        }),
    )
}
