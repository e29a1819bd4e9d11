use std::sync::Arc;

use crate::config::{AppConfig, RetryPolicy};
use crate::services::export::BatchExporter;
use crate::services::job::{JobController, JobPaths, JobRegistry};
use crate::services::llm::{LlmError, LlmService};
use crate::services::providers::HttpLlmClient;

/// Builds a client for `(model_id, api_key)`; used to check user-supplied keys.
pub type LlmFactory =
    Arc<dyn Fn(&str, &str) -> Result<Arc<dyn LlmService>, LlmError> + Send + Sync>;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub llm: Arc<dyn LlmService>,
    pub jobs: JobController,
    pub exporter: Arc<BatchExporter>,
    pub paths: Arc<JobPaths>,
    pub retry_policy: RetryPolicy,
    pub temperature: f32,
    pub default_model_id: Arc<str>,
    pub llm_factory: LlmFactory,
}

impl AppState {
    pub fn new(config: &AppConfig, llm: Arc<dyn LlmService>, llm_factory: LlmFactory) -> Self {
        let paths = JobPaths::new(&config.data_dir);
        let jobs = JobController::new(
            llm.clone(),
            config.job_settings(),
            paths.clone(),
            JobRegistry::new(),
        );
        Self {
            llm,
            jobs,
            exporter: Arc::new(BatchExporter::new(&paths.exports_dir)),
            paths: Arc::new(paths),
            retry_policy: config.retry_single_policy(),
            temperature: config.llm_temperature,
            default_model_id: Arc::from(config.llm_model_id.as_str()),
            llm_factory,
        }
    }

    /// Factory producing real HTTP clients, honouring the configured base URL
    /// only for the configured provider.
    pub fn http_factory(config: &AppConfig) -> LlmFactory {
        let configured = config.llm_model_id.clone();
        let base_url = config.llm_base_url.clone();
        Arc::new(move |model_id: &str, api_key: &str| {
            let base = if model_id == configured { base_url.as_deref() } else { None };
            let client = HttpLlmClient::new(model_id, api_key, base)?;
            Ok(Arc::new(client) as Arc<dyn LlmService>)
        })
    }
}
