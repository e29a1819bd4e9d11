//! Run one extraction job from a text file (one row per line) and write the
//! NDJSON event stream to stdout.
//!
//! Usage: `batch <rows-file> [job-id] [resume-from]`

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tracing_subscriber::EnvFilter;

use disease_extract::config::AppConfig;
use disease_extract::models::event::StreamEvent;
use disease_extract::services::job::{JobController, JobPaths, JobRegistry, JobRequest, RowSource};
use disease_extract::services::providers::HttpLlmClient;

#[tokio::main]
async fn main() {
    // Logs go to stderr so stdout carries only the event stream
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let Some(rows_file) = args.next() else {
        eprintln!("usage: batch <rows-file> [job-id] [resume-from]");
        std::process::exit(2);
    };
    let job_id = args.next();
    let resume_from = match args.next().map(|s| s.parse::<usize>()) {
        None => 0,
        Some(Ok(n)) => n,
        Some(Err(e)) => {
            eprintln!("invalid resume-from: {}", e);
            std::process::exit(2);
        }
    };

    let config = AppConfig::from_env().expect("Failed to load configuration");

    let content = tokio::fs::read_to_string(&rows_file)
        .await
        .expect("Failed to read rows file");
    let rows: Vec<String> = content.lines().map(str::to_string).collect();

    tracing::info!(rows_file = %rows_file, rows = rows.len(), resume_from, "Starting batch job");

    let llm = HttpLlmClient::new(
        &config.llm_model_id,
        config.llm_api_key.clone(),
        config.llm_base_url.as_deref(),
    )
    .expect("Failed to initialize LLM client");
    let controller = JobController::new(
        Arc::new(llm),
        config.job_settings(),
        JobPaths::new(&config.data_dir),
        JobRegistry::new(),
    );

    let mut events = controller.spawn(JobRequest {
        job_id,
        source: RowSource::Rows(rows),
        system_prompt: None,
        user_prompt: None,
        resume_from,
        concurrency: None,
    });

    let mut stdout = tokio::io::stdout();
    let mut failed = false;
    while let Some(event) = events.recv().await {
        failed = matches!(event, StreamEvent::Error { .. });
        let terminal = event.is_terminal();
        match event.to_frame() {
            Ok(frame) => {
                if let Err(e) = stdout.write_all(&frame).await {
                    tracing::error!(error = %e, "Failed to write to stdout");
                    break;
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to encode event"),
        }
        if terminal {
            break;
        }
    }
    let _ = stdout.flush().await;

    if failed {
        std::process::exit(1);
    }
}
