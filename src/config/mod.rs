use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Root directory for job logs, checkpoints and batch exports.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// API key for the configured LLM provider
    pub llm_api_key: String,

    /// Model id in `provider/model` form (e.g., "deepseek/deepseek-chat")
    #[serde(default = "default_model_id")]
    pub llm_model_id: String,

    /// Overrides the provider's default base URL
    #[serde(default)]
    pub llm_base_url: Option<String>,

    #[serde(default = "default_temperature")]
    pub llm_temperature: f32,

    /// Rows dispatched concurrently per group
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,

    /// Rows between checkpoints / progress events
    #[serde(default = "default_save_interval")]
    pub save_interval: usize,

    /// Groups between heartbeats
    #[serde(default = "default_heartbeat_batch_interval")]
    pub heartbeat_batch_interval: usize,

    /// Retry budget for the synchronous single-row endpoint
    #[serde(default = "default_retry_single_max_retries")]
    pub retry_single_max_retries: u32,

    /// Frames buffered between the job task and the HTTP response
    #[serde(default = "default_stream_buffer_size")]
    pub stream_buffer_size: usize,

    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_model_id() -> String {
    "deepseek/deepseek-chat".to_string()
}

fn default_temperature() -> f32 {
    0.3
}

fn default_concurrency() -> usize {
    20
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    2000
}

fn default_attempt_timeout_ms() -> u64 {
    15_000
}

fn default_save_interval() -> usize {
    100
}

fn default_heartbeat_batch_interval() -> usize {
    5
}

fn default_retry_single_max_retries() -> u32 {
    2
}

fn default_stream_buffer_size() -> usize {
    256
}

fn default_max_body_bytes() -> usize {
    20 * 1024 * 1024
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: AppConfig = envy::from_env()?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("CONCURRENCY must be at least 1".into()));
        }
        if self.save_interval == 0 {
            return Err(ConfigError::Invalid("SAVE_INTERVAL must be at least 1".into()));
        }
        if self.heartbeat_batch_interval == 0 {
            return Err(ConfigError::Invalid("HEARTBEAT_BATCH_INTERVAL must be at least 1".into()));
        }
        if self.stream_buffer_size == 0 {
            return Err(ConfigError::Invalid("STREAM_BUFFER_SIZE must be at least 1".into()));
        }
        Ok(())
    }

    pub fn job_settings(&self) -> JobSettings {
        JobSettings {
            concurrency: self.concurrency,
            retry: RetryPolicy {
                max_retries: self.max_retries,
                retry_delay: Duration::from_millis(self.retry_delay_ms),
                attempt_timeout: Duration::from_millis(self.attempt_timeout_ms),
            },
            save_interval: self.save_interval,
            heartbeat_batch_interval: self.heartbeat_batch_interval,
            stream_buffer_size: self.stream_buffer_size,
            temperature: self.llm_temperature,
        }
    }

    /// Policy for `POST /api/retry`: same timing, smaller budget.
    pub fn retry_single_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry_single_max_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            attempt_timeout: Duration::from_millis(self.attempt_timeout_ms),
        }
    }
}

/// Per-row retry budget and timing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay: Duration::from_millis(default_retry_delay_ms()),
            attempt_timeout: Duration::from_millis(default_attempt_timeout_ms()),
        }
    }
}

/// Knobs the job controller and scheduler need for one run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobSettings {
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub save_interval: usize,
    pub heartbeat_batch_interval: usize,
    pub stream_buffer_size: usize,
    pub temperature: f32,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            retry: RetryPolicy::default(),
            save_interval: default_save_interval(),
            heartbeat_batch_interval: default_heartbeat_batch_interval(),
            stream_buffer_size: default_stream_buffer_size(),
            temperature: default_temperature(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<AppConfig, envy::Error> {
        envy::from_iter(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())))
    }

    #[test]
    fn test_defaults_applied() {
        let config = from_pairs(&[("LLM_API_KEY", "sk-test")]).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
        assert_eq!(config.concurrency, 20);
        assert_eq!(config.save_interval, 100);
        assert_eq!(config.heartbeat_batch_interval, 5);
        assert_eq!(config.llm_model_id, "deepseek/deepseek-chat");
        assert!(config.check().is_ok());

        let settings = config.job_settings();
        assert_eq!(settings.retry.max_retries, 5);
        assert_eq!(settings.retry.attempt_timeout, Duration::from_secs(15));
        assert_eq!(config.retry_single_policy().max_retries, 2);
    }

    #[test]
    fn test_missing_api_key_is_error() {
        assert!(from_pairs(&[]).is_err());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = from_pairs(&[("LLM_API_KEY", "k"), ("CONCURRENCY", "0")]).unwrap();
        assert!(matches!(config.check(), Err(ConfigError::Invalid(_))));
    }
}
