use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::llm::{ChatMessage, InvokeOptions, LlmError, LlmResponse, LlmService, Role, Usage};

/// Wire dialect spoken by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderApi {
    /// `POST {base}/chat/completions` with bearer auth.
    OpenAiCompatible,
    /// `POST {base}/models/{model}:generateContent?key=...`
    Gemini,
}

#[derive(Debug, Clone, Copy)]
pub struct ProviderInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub base_url: &'static str,
    pub api: ProviderApi,
    pub default_model: &'static str,
}

pub const PROVIDERS: &[ProviderInfo] = &[
    ProviderInfo {
        id: "deepseek",
        name: "DeepSeek",
        base_url: "https://api.deepseek.com",
        api: ProviderApi::OpenAiCompatible,
        default_model: "deepseek-chat",
    },
    ProviderInfo {
        id: "qwen",
        name: "通义千问",
        base_url: "https://dashscope.aliyuncs.com/compatible-mode/v1",
        api: ProviderApi::OpenAiCompatible,
        default_model: "qwen-turbo",
    },
    ProviderInfo {
        id: "openai",
        name: "OpenAI",
        base_url: "https://api.openai.com/v1",
        api: ProviderApi::OpenAiCompatible,
        default_model: "gpt-4o-mini",
    },
    ProviderInfo {
        id: "gemini",
        name: "Gemini",
        base_url: "https://generativelanguage.googleapis.com/v1beta",
        api: ProviderApi::Gemini,
        default_model: "gemini-1.5-flash",
    },
];

pub fn provider_info(provider_id: &str) -> Option<&'static ProviderInfo> {
    PROVIDERS.iter().find(|p| p.id == provider_id)
}

/// Split `provider/model` into its parts.
pub fn parse_model_id(model_id: &str) -> Result<(&str, &str), LlmError> {
    match model_id.split_once('/') {
        Some((provider, model))
            if !provider.is_empty() && !model.is_empty() && !model.contains('/') =>
        {
            Ok((provider, model))
        }
        _ => Err(LlmError::InvalidModelId(model_id.to_string())),
    }
}

/// HTTP client for the providers in [`PROVIDERS`].
pub struct HttpLlmClient {
    http: Client,
    provider: &'static ProviderInfo,
    base_url: String,
    model: String,
    api_key: String,
}

impl HttpLlmClient {
    /// `model_id` is `provider/model`, or a bare provider id to use its default model.
    pub fn new(
        model_id: &str,
        api_key: impl Into<String>,
        base_url: Option<&str>,
    ) -> Result<Self, LlmError> {
        let (provider_id, model) = if model_id.contains('/') {
            let (provider_id, model) = parse_model_id(model_id)?;
            (provider_id, Some(model))
        } else {
            (model_id, None)
        };
        let provider = provider_info(provider_id)
            .ok_or_else(|| LlmError::UnknownProvider(provider_id.to_string()))?;
        let model = model.unwrap_or(provider.default_model);

        let http = Client::builder()
            .user_agent(concat!("disease-extract/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            provider,
            base_url: base_url.unwrap_or(provider.base_url).trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.into(),
        })
    }

    pub fn provider(&self) -> &'static ProviderInfo {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn invoke_openai(
        &self,
        messages: &[ChatMessage],
        options: &InvokeOptions,
        model: &str,
    ) -> Result<LlmResponse, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = ChatCompletionRequest {
            model,
            messages,
            temperature: options.temperature.unwrap_or(0.3),
            top_p: options.top_p,
            max_tokens: options.max_tokens,
            stream: false,
        };

        let response = self.http.post(&url).bearer_auth(&self.api_key).json(&request).send().await?;
        let body = read_body(response).await?;
        let parsed: ChatCompletionResponse =
            serde_json::from_str(&body).map_err(|e| LlmError::Parse(e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::EmptyContent {
                model: model.to_string(),
            })?;

        Ok(LlmResponse {
            content,
            model: parsed.model.unwrap_or_else(|| model.to_string()),
            usage: parsed.usage.map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
        })
    }

    async fn invoke_gemini(
        &self,
        messages: &[ChatMessage],
        options: &InvokeOptions,
        model: &str,
    ) -> Result<LlmResponse, LlmError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, model);

        let system_instruction = messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| GeminiContent {
                role: None,
                parts: vec![GeminiPart { text: m.content.clone() }],
            });
        let contents = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| GeminiContent {
                role: Some(if m.role == Role::Assistant { "model" } else { "user" }),
                parts: vec![GeminiPart { text: m.content.clone() }],
            })
            .collect();

        let request = GeminiRequest {
            contents,
            system_instruction,
            generation_config: GeminiGenerationConfig {
                temperature: options.temperature.unwrap_or(0.3),
                top_p: options.top_p,
                max_output_tokens: options.max_tokens,
            },
        };

        let response = self
            .http
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&request)
            .send()
            .await?;
        let body = read_body(response).await?;
        let parsed: GeminiResponse =
            serde_json::from_str(&body).map_err(|e| LlmError::Parse(e.to_string()))?;

        let content = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .ok_or_else(|| LlmError::EmptyContent {
                model: model.to_string(),
            })?;

        Ok(LlmResponse {
            content,
            model: model.to_string(),
            usage: parsed.usage_metadata.map(|u| Usage {
                prompt_tokens: u.prompt_token_count,
                completion_tokens: u.candidates_token_count,
                total_tokens: u.total_token_count,
            }),
        })
    }
}

#[async_trait]
impl LlmService for HttpLlmClient {
    async fn invoke(
        &self,
        messages: &[ChatMessage],
        options: &InvokeOptions,
    ) -> Result<LlmResponse, LlmError> {
        let model = options.model.as_deref().unwrap_or(&self.model);
        let call = async {
            match self.provider.api {
                ProviderApi::OpenAiCompatible => self.invoke_openai(messages, options, model).await,
                ProviderApi::Gemini => self.invoke_gemini(messages, options, model).await,
            }
        };

        tokio::select! {
            _ = options.cancel.cancelled() => Err(LlmError::Cancelled),
            result = call => result,
        }
    }
}

async fn read_body(response: reqwest::Response) -> Result<String, LlmError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(LlmError::Api {
            status: status.as_u16(),
            body,
        });
    }
    Ok(body)
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize, Deserialize)]
struct GeminiPart {
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: GeminiCandidateContent,
}

#[derive(Deserialize)]
struct GeminiCandidateContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    #[serde(default)]
    total_token_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_model_id() {
        assert_eq!(
            parse_model_id("deepseek/deepseek-chat").unwrap(),
            ("deepseek", "deepseek-chat")
        );
        assert!(parse_model_id("deepseek").is_err());
        assert!(parse_model_id("/model").is_err());
        assert!(parse_model_id("a/b/c").is_err());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let err = HttpLlmClient::new("acme/some-model", "key", None).err().unwrap();
        assert!(matches!(err, LlmError::UnknownProvider(p) if p == "acme"));
    }

    #[test]
    fn test_base_url_override() {
        let client =
            HttpLlmClient::new("openai/gpt-4o", "key", Some("http://localhost:8080/v1/")).unwrap();
        assert_eq!(client.base_url, "http://localhost:8080/v1");
        assert_eq!(client.model(), "gpt-4o");
        assert_eq!(client.provider().api, ProviderApi::OpenAiCompatible);
    }

    #[test]
    fn test_bare_provider_uses_default_model() {
        let client = HttpLlmClient::new("gemini", "key", None).unwrap();
        assert_eq!(client.model(), "gemini-1.5-flash");
        assert_eq!(client.provider().api, ProviderApi::Gemini);
    }

    #[test]
    fn test_gemini_response_shape() {
        let body = r#"{
            "candidates": [{ "content": { "parts": [{ "text": "[感冒]" }] } }],
            "usageMetadata": {
                "promptTokenCount": 3,
                "candidatesTokenCount": 2,
                "totalTokenCount": 5
            }
        }"#;
        let parsed: GeminiResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.candidates[0].content.parts[0].text, "[感冒]");
        assert_eq!(parsed.usage_metadata.unwrap().total_token_count, 5);
    }

    #[test]
    fn test_chat_completion_request_shape() {
        let messages = [ChatMessage::user("hi")];
        let request = ChatCompletionRequest {
            model: "deepseek-chat",
            messages: &messages,
            temperature: 0.3,
            top_p: None,
            max_tokens: None,
            stream: false,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["messages"][0]["role"], "user");
        assert!(value.get("top_p").is_none());
    }
}
