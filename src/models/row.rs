use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Classification of a failed LLM attempt.
///
/// Serialized in SCREAMING_SNAKE_CASE so stream consumers see `LLM_TIMEOUT`,
/// `NETWORK`, etc.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    LlmTimeout,
    Network,
    ResponseParse,
    LlmCall,
    Unknown,
}

/// Keyword groups checked in priority order; the first group with a match wins.
/// Matching is case-sensitive.
const CLASSIFICATION_RULES: &[(ErrorKind, &[&str])] = &[
    (ErrorKind::LlmTimeout, &["timeout", "Timeout", "timed out"]),
    (
        ErrorKind::Network,
        &[
            "network",
            "ECONNREFUSED",
            "ETIMEDOUT",
            "connection refused",
            "error sending request",
            "dns error",
        ],
    ),
    (ErrorKind::ResponseParse, &["parse", "JSON", "decoding"]),
    (ErrorKind::LlmCall, &["API", "LLM", "model"]),
];

impl ErrorKind {
    /// Classify an error message by substring match.
    pub fn classify(message: &str) -> Self {
        CLASSIFICATION_RULES
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|k| message.contains(k)))
            .map(|(kind, _)| *kind)
            .unwrap_or(ErrorKind::Unknown)
    }
}

/// One unit of work: a single non-blank text cell.
#[derive(Debug, Clone)]
pub struct RowTask {
    /// 0-based position in the job's row sequence.
    pub index: usize,
    pub text: String,
    /// 0-based retry counter, advanced by the invoker.
    pub attempt: u32,
}

impl RowTask {
    pub fn new(index: usize, text: impl Into<String>) -> Self {
        Self {
            index,
            text: text.into(),
            attempt: 0,
        }
    }
}

/// Terminal outcome for one row. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RowResult {
    pub index: usize,
    pub original_text: String,
    /// Empty means "no diseases found", which is a success.
    #[serde(default)]
    pub diseases: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub retryable: bool,
    #[serde(default)]
    pub processing_time_ms: u64,
}

impl RowResult {
    pub fn success(task: &RowTask, diseases: Vec<String>, processing_time_ms: u64) -> Self {
        Self {
            index: task.index,
            original_text: task.text.clone(),
            diseases,
            error: None,
            error_message: None,
            retryable: false,
            processing_time_ms,
        }
    }

    pub fn failure(
        task: &RowTask,
        kind: ErrorKind,
        message: impl Into<String>,
        retryable: bool,
        processing_time_ms: u64,
    ) -> Self {
        Self {
            index: task.index,
            original_text: task.text.clone(),
            diseases: Vec::new(),
            error: Some(kind),
            error_message: Some(message.into()),
            retryable,
            processing_time_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// `KIND: message` as shown to the client.
    pub fn error_label(&self) -> Option<String> {
        self.error.map(|kind| match &self.error_message {
            Some(msg) => format!("{}: {}", kind, msg),
            None => kind.to_string(),
        })
    }
}

/// Running totals maintained incrementally by the scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregates {
    pub processed_count: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub total_diseases: usize,
}

impl Aggregates {
    pub fn record(&mut self, result: &RowResult) {
        self.processed_count += 1;
        if result.is_success() {
            self.success_count += 1;
            self.total_diseases += result.diseases.len();
        } else {
            self.failure_count += 1;
        }
    }

    /// Rebuild totals from a stored result list (legacy checkpoints only).
    pub fn from_results(results: &[RowResult]) -> Self {
        let mut aggregates = Self::default();
        for result in results {
            aggregates.record(result);
        }
        aggregates
    }
}
