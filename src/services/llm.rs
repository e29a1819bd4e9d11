//! The text-completion capability the pipeline depends on.
//!
//! Everything above this module only sees [`LlmService`]; concrete providers
//! live in [`crate::services::providers`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    /// Overrides the service's default model.
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    /// Fired when the caller gives up on this call. Implementations should stop
    /// work promptly; the result is ignored either way.
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
    pub usage: Option<Usage>,
}

#[async_trait]
pub trait LlmService: Send + Sync {
    async fn invoke(
        &self,
        messages: &[ChatMessage],
        options: &InvokeOptions,
    ) -> Result<LlmResponse, LlmError>;

    /// Check the credentials with a trivial request.
    async fn validate(&self) -> bool {
        let messages = [ChatMessage::system("你是一个测试助手"), ChatMessage::user("回复\"OK\"")];
        match self.invoke(&messages, &InvokeOptions::default()).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = %e, "LLM credential validation failed");
                false
            }
        }
    }
}

/// Error messages are matched by [`crate::models::row::ErrorKind::classify`],
/// so each variant's text carries the keyword of its category.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("network request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("LLM API error: {status} - {body}")]
    Api { status: u16, body: String },

    #[error("failed to parse provider response: {0}")]
    Parse(String),

    #[error("LLM returned no content (model: {model})")]
    EmptyContent { model: String },

    #[error("LLM call cancelled")]
    Cancelled,

    #[error("invalid model id: {0}")]
    InvalidModelId(String),

    #[error("unsupported provider: {0}")]
    UnknownProvider(String),
}
