use std::sync::Arc;

use axum::routing::get;
use tracing_subscriber::EnvFilter;

use disease_extract::app_state::AppState;
use disease_extract::config::AppConfig;
use disease_extract::routes;
use disease_extract::services::providers::HttpLlmClient;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!(
        model = %config.llm_model_id,
        data_dir = %config.data_dir.display(),
        "Initializing disease-extract server"
    );

    let prometheus_handle = routes::metrics::install_recorder()
        .expect("Failed to install Prometheus metrics recorder");

    tracing::info!("Initializing LLM client");
    let llm = HttpLlmClient::new(
        &config.llm_model_id,
        config.llm_api_key.clone(),
        config.llm_base_url.as_deref(),
    )
    .expect("Failed to initialize LLM client");

    let state = AppState::new(&config, Arc::new(llm), AppState::http_factory(&config));

    let app = routes::router(state, config.max_body_bytes).route(
        "/metrics",
        get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
    );

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await.expect("Server error");
}
