use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;

/// Install the global Prometheus recorder and describe the pipeline metrics.
pub fn install_recorder() -> Result<Arc<PrometheusHandle>, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    metrics::describe_counter!("jobs_started_total", "Analysis jobs started");
    metrics::describe_counter!("jobs_completed_total", "Analysis jobs that processed every row");
    metrics::describe_counter!("jobs_failed_total", "Analysis jobs ended by a job-level error");
    metrics::describe_counter!(
        "jobs_interrupted_total",
        "Analysis jobs cancelled before the last row"
    );
    metrics::describe_counter!("rows_processed_total", "Rows that produced a result");
    metrics::describe_counter!(
        "row_failures_total",
        "Rows that failed after all retries, by error type"
    );
    metrics::describe_counter!("llm_attempts_total", "Individual LLM call attempts");
    metrics::describe_histogram!("llm_attempt_seconds", "Duration of one LLM call attempt");

    Ok(Arc::new(handle))
}

/// Prometheus metrics scrape endpoint.
/// Returns metrics in Prometheus text exposition format.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}
