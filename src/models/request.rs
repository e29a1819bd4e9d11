use garde::Validate;
use serde::{Deserialize, Serialize};

/// Body of `POST /api/analyze`.
///
/// Rows come either as a flat `rows` list or as a `table` plus the `column`
/// header to read.
#[derive(Debug, Default, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeRequest {
    #[garde(skip)]
    pub rows: Option<Vec<String>>,

    #[garde(skip)]
    pub table: Option<TableInput>,

    #[garde(length(min = 1, max = 200))]
    pub column: Option<String>,

    #[garde(length(max = 8000))]
    pub system_prompt: Option<String>,

    #[garde(length(max = 2000))]
    pub user_prompt: Option<String>,

    /// Doubles as a file name component, so it is restricted to a safe alphabet.
    #[garde(length(min = 1, max = 64), pattern(r"^[A-Za-z0-9_-]+$"))]
    pub job_id: Option<String>,

    #[garde(skip)]
    pub resume_from: Option<usize>,

    #[garde(range(min = 1, max = 100))]
    pub concurrency: Option<usize>,
}

/// Already-parsed spreadsheet: a header row plus data rows.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct TableInput {
    pub headers: Vec<String>,
    #[serde(default)]
    pub records: Vec<Vec<String>>,
}

/// Body of `POST /api/retry`.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RetryRequest {
    #[garde(length(min = 1, max = 20000))]
    pub text: String,

    #[garde(length(max = 8000))]
    pub system_prompt: Option<String>,

    #[garde(length(max = 2000))]
    pub user_prompt: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryResponse {
    pub success: bool,
    pub diseases: Vec<String>,
    pub raw_response: String,
}

/// Error body shared by the synchronous endpoints.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Body of `POST /api/validate-key`.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ValidateKeyRequest {
    #[garde(length(min = 1))]
    pub api_key: String,

    #[garde(length(min = 3, max = 200))]
    pub model_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateKeyResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Response of `POST /api/jobs/{job_id}/abort`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortResponse {
    pub job_id: String,
    pub status: String,
}
