//! Job lifecycle: input extraction, resume, wiring scheduler output to the
//! stream and the checkpoint store, and the single terminal event.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::JobSettings;
use crate::models::checkpoint::Checkpoint;
use crate::models::event::{format_duration, ResultEvent, StreamEvent};
use crate::models::job::{generate_job_id, Job, JobStatus};
use crate::models::request::{AnalyzeRequest, TableInput};
use crate::models::row::{Aggregates, RowResult};
use crate::services::checkpoint_store::CheckpointStore;
use crate::services::emitter::{EventEmitter, JobLogger};
use crate::services::export::BatchExporter;
use crate::services::invoker::RetryableInvoker;
use crate::services::llm::LlmService;
use crate::services::scheduler::{
    BatchScheduler, CheckpointReason, Outcome, SchedulerConfig, SchedulerEvent,
};

/// Directory layout under the data root.
#[derive(Debug, Clone)]
pub struct JobPaths {
    pub logs_dir: PathBuf,
    pub checkpoints_dir: PathBuf,
    pub exports_dir: PathBuf,
}

impl JobPaths {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            logs_dir: data_dir.join("logs"),
            checkpoints_dir: data_dir.join("checkpoints"),
            exports_dir: data_dir.join("exports"),
        }
    }

    pub fn log_file(&self, job_id: &str) -> PathBuf {
        self.logs_dir.join(format!("analysis-{}.log", job_id))
    }
}

/// Job-level failures. Each maps to the `errorType` of the terminal event.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum JobError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("column not found: {0}")]
    MissingColumn(String),

    #[error("no non-empty rows to analyse")]
    EmptyInput,

    #[error("job {0} is already running")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl JobError {
    pub fn error_type(&self) -> &'static str {
        match self {
            JobError::InvalidInput(_) => "INVALID_INPUT",
            JobError::MissingColumn(_) => "MISSING_COLUMN",
            JobError::EmptyInput => "EMPTY_INPUT",
            JobError::Conflict(_) => "JOB_CONFLICT",
            JobError::Internal(_) => "INTERNAL",
        }
    }
}

/// Where the row texts come from.
#[derive(Debug, Clone)]
pub enum RowSource {
    Rows(Vec<String>),
    Table { table: TableInput, column: String },
}

impl RowSource {
    /// Produce the 0-based row sequence, dropping blank cells.
    pub fn extract(self) -> Result<Vec<String>, JobError> {
        let texts: Vec<String> = match self {
            RowSource::Rows(rows) => rows.into_iter().filter(|t| !t.trim().is_empty()).collect(),
            RowSource::Table { table, column } => {
                let col = table
                    .headers
                    .iter()
                    .position(|h| h == &column)
                    .ok_or(JobError::MissingColumn(column))?;
                table
                    .records
                    .into_iter()
                    .filter_map(|mut record| (col < record.len()).then(|| record.swap_remove(col)))
                    .filter(|t| !t.trim().is_empty())
                    .collect()
            }
        };
        if texts.is_empty() {
            return Err(JobError::EmptyInput);
        }
        Ok(texts)
    }
}

/// One analysis request after validation.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub job_id: Option<String>,
    pub source: RowSource,
    pub system_prompt: Option<String>,
    pub user_prompt: Option<String>,
    pub resume_from: usize,
    pub concurrency: Option<usize>,
}

impl TryFrom<AnalyzeRequest> for JobRequest {
    type Error = JobError;

    fn try_from(req: AnalyzeRequest) -> Result<Self, Self::Error> {
        let source = match (req.rows, req.table, req.column) {
            (Some(rows), None, _) => RowSource::Rows(rows),
            (None, Some(table), Some(column)) => RowSource::Table { table, column },
            (None, Some(_), None) => {
                return Err(JobError::InvalidInput("`column` is required with `table`".into()))
            }
            (Some(_), Some(_), _) => {
                return Err(JobError::InvalidInput("send either `rows` or `table`".into()))
            }
            (None, None, _) => {
                return Err(JobError::InvalidInput("`rows` or `table` is required".into()))
            }
        };
        Ok(Self {
            job_id: req.job_id,
            source,
            system_prompt: req.system_prompt,
            user_prompt: req.user_prompt,
            resume_from: req.resume_from.unwrap_or(0),
            concurrency: req.concurrency,
        })
    }
}

/// Running jobs by id, with the token that cancels each.
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `job_id` until the returned guard is dropped.
    pub fn register(
        &self,
        job_id: &str,
        cancel: CancellationToken,
    ) -> Result<RegistrationGuard, JobError> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if jobs.contains_key(job_id) {
            return Err(JobError::Conflict(job_id.to_string()));
        }
        jobs.insert(job_id.to_string(), cancel);
        Ok(RegistrationGuard {
            registry: self.clone(),
            job_id: job_id.to_string(),
        })
    }

    /// Fire the job's cancel token. Returns `false` if no such job is running.
    pub fn cancel(&self, job_id: &str) -> bool {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        match jobs.get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).contains_key(job_id)
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct RegistrationGuard {
    registry: JobRegistry,
    job_id: String,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.job_id);
    }
}

/// Everything one running job needs, passed explicitly instead of globals.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: String,
    pub paths: JobPaths,
    pub store: CheckpointStore,
    pub exporter: BatchExporter,
    pub emitter: EventEmitter,
    pub logger: JobLogger,
    pub cancel: CancellationToken,
}

/// One checkpoint request from the scheduler.
struct Batch {
    aggregates: Aggregates,
    number: usize,
    reason: CheckpointReason,
}

/// Owns job lifecycles. Cheap to clone into request handlers.
#[derive(Clone)]
pub struct JobController {
    llm: Arc<dyn LlmService>,
    settings: JobSettings,
    paths: JobPaths,
    registry: JobRegistry,
}

impl JobController {
    pub fn new(
        llm: Arc<dyn LlmService>,
        settings: JobSettings,
        paths: JobPaths,
        registry: JobRegistry,
    ) -> Self {
        Self {
            llm,
            settings,
            paths,
            registry,
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn paths(&self) -> &JobPaths {
        &self.paths
    }

    pub fn settings(&self) -> &JobSettings {
        &self.settings
    }

    /// Start a job in the background and return its event stream.
    ///
    /// A panic inside the job is turned into a terminal `INTERNAL` error.
    pub fn spawn(&self, request: JobRequest) -> mpsc::Receiver<StreamEvent> {
        let cancel = CancellationToken::new();
        let (emitter, rx) =
            EventEmitter::channel(self.settings.stream_buffer_size, cancel.clone());
        let controller = self.clone();
        let processed = Arc::new(AtomicUsize::new(0));

        let supervisor = emitter.clone();
        let counter = processed.clone();
        tokio::spawn(async move {
            let job = tokio::spawn(async move {
                controller.run(request, emitter, cancel, processed).await
            });
            supervise(job, supervisor, counter).await;
        });

        rx
    }

    /// Run one job to its terminal event and return the final status.
    pub async fn run(
        &self,
        request: JobRequest,
        emitter: EventEmitter,
        cancel: CancellationToken,
        processed: Arc<AtomicUsize>,
    ) -> JobStatus {
        let started = Instant::now();
        let job_id = request.job_id.clone().unwrap_or_else(generate_job_id);
        let mut job = Job::new(&job_id);

        let _registration = match self.registry.register(&job_id, cancel.clone()) {
            Ok(guard) => guard,
            Err(e) => {
                tracing::warn!(job_id = %job_id, "Rejected job with a running id");
                metrics::counter!("jobs_failed_total").increment(1);
                let _ = emitter.finish(terminal_error(&e, 0)).await;
                return JobStatus::Errored;
            }
        };

        let logger = JobLogger::open(&job_id, &self.paths.log_file(&job_id), emitter.clone()).await;
        let ctx = JobContext {
            job_id: job_id.clone(),
            paths: self.paths.clone(),
            store: CheckpointStore::new(&self.paths.checkpoints_dir),
            exporter: BatchExporter::new(&self.paths.exports_dir),
            emitter,
            logger,
            cancel,
        };

        metrics::counter!("jobs_started_total").increment(1);
        let _ = ctx.emitter.send(StreamEvent::Start { job_id: job_id.clone() }).await;
        ctx.logger
            .info("Analysis started", Some(json!({ "resumeFrom": request.resume_from })))
            .await;

        let rows: Arc<[String]> = match request.source.extract() {
            Ok(rows) => rows.into(),
            Err(e) => return self.fail(ctx, &mut job, e, 0).await,
        };
        job.total_rows = rows.len();
        ctx.logger
            .info("Rows extracted", Some(json!({ "totalRows": rows.len() })))
            .await;
        let _ = ctx.emitter.send(StreamEvent::Total { count: rows.len() }).await;

        let (restored, mut saved_files) = self.restore(&ctx, request.resume_from).await;
        job.resume_offset = restored.processed_count.min(rows.len());
        processed.store(job.resume_offset, Ordering::Relaxed);

        if let Err(e) = job.transition(JobStatus::Running) {
            let offset = job.resume_offset;
            return self.fail(ctx, &mut job, JobError::Internal(e.to_string()), offset).await;
        }

        let concurrency = request.concurrency.unwrap_or(self.settings.concurrency);
        let invoker =
            RetryableInvoker::new(self.llm.clone(), self.settings.retry, ctx.logger.clone())
                .with_prompts(request.system_prompt, request.user_prompt)
                .with_temperature(self.settings.temperature);
        let scheduler = BatchScheduler::new(
            rows.clone(),
            invoker,
            SchedulerConfig {
                concurrency,
                save_interval: self.settings.save_interval,
                heartbeat_batch_interval: self.settings.heartbeat_batch_interval,
            },
            ctx.cancel.clone(),
        )
        .resume_from(restored, saved_files.len() + 1);

        ctx.logger
            .info(
                "Dispatching rows",
                Some(json!({
                    "from": job.resume_offset,
                    "total": rows.len(),
                    "concurrency": concurrency,
                })),
            )
            .await;

        let mut outcome = (Outcome::Cancelled, restored);
        let mut unsaved: Vec<RowResult> = Vec::new();
        let mut durable = restored.processed_count;
        let mut events = std::pin::pin!(scheduler.into_stream());
        while let Some(event) = events.next().await {
            match event {
                SchedulerEvent::Result(result) => {
                    metrics::counter!("rows_processed_total").increment(1);
                    processed.fetch_add(1, Ordering::Relaxed);
                    let _ = ctx.emitter.send(StreamEvent::Result(ResultEvent::from(&result))).await;
                }
                SchedulerEvent::Checkpoint {
                    aggregates,
                    results,
                    batch_number,
                    reason,
                } => {
                    unsaved.extend(results);
                    let batch = Batch {
                        aggregates,
                        number: batch_number,
                        reason,
                    };
                    if self.persist(&ctx, batch, &mut unsaved, &mut saved_files).await {
                        durable = aggregates.processed_count;
                    }
                }
                SchedulerEvent::Progress { processed } => {
                    let elapsed = started.elapsed().as_millis() as u64;
                    let _ = ctx
                        .emitter
                        .send(StreamEvent::progress(processed, rows.len(), elapsed))
                        .await;
                }
                SchedulerEvent::Heartbeat { timestamp, processed } => {
                    let _ = ctx.emitter.send(StreamEvent::Heartbeat { timestamp, processed }).await;
                }
                SchedulerEvent::Finished { outcome: o, aggregates } => outcome = (o, aggregates),
            }
        }

        if !unsaved.is_empty() {
            ctx.logger
                .error(
                    "Rows were streamed but never exported",
                    Some(json!({
                        "rows": unsaved.len(),
                        "fromIndex": unsaved.first().map(|r| r.index),
                    })),
                )
                .await;
        }

        let (outcome, totals) = outcome;
        let elapsed = started.elapsed().as_millis() as u64;
        match outcome {
            Outcome::Completed => self.complete(ctx, &mut job, totals, saved_files, elapsed).await,
            Outcome::Cancelled => self.interrupt(ctx, &mut job, totals, durable).await,
        }
    }

    /// Load the checkpoint when the client asks to resume. Returns the
    /// restored totals and the export files written so far.
    async fn restore(&self, ctx: &JobContext, resume_from: usize) -> (Aggregates, Vec<String>) {
        if resume_from == 0 {
            return (Aggregates::default(), Vec::new());
        }

        let Some(checkpoint) = ctx.store.load(&ctx.job_id).await else {
            ctx.logger
                .warn(
                    "No usable checkpoint, restarting from the first row",
                    Some(json!({ "resumeFrom": resume_from })),
                )
                .await;
            return (Aggregates::default(), Vec::new());
        };

        let aggregates = checkpoint.aggregates();
        if checkpoint.processed_count() != resume_from {
            ctx.logger
                .warn(
                    "resumeFrom does not match the checkpoint, using the checkpoint",
                    Some(json!({
                        "resumeFrom": resume_from,
                        "processedCount": checkpoint.processed_count(),
                    })),
                )
                .await;
        }
        ctx.logger
            .info(
                "Restored from checkpoint",
                Some(json!({
                    "processedCount": aggregates.processed_count,
                    "successCount": aggregates.success_count,
                    "failureCount": aggregates.failure_count,
                    "totalDiseases": aggregates.total_diseases,
                })),
            )
            .await;
        let _ = ctx
            .emitter
            .send(StreamEvent::Resume {
                count: checkpoint.restored_count(),
                message: format!("已从第 {} 条继续处理", aggregates.processed_count + 1),
            })
            .await;

        (aggregates, checkpoint.saved_files().to_vec())
    }

    /// Export `unsaved` as one batch, then advance the checkpoint. Returns
    /// whether the checkpoint now covers `batch`.
    ///
    /// A failed export leaves the checkpoint where it was and keeps the rows in
    /// `unsaved` for the next batch, so every row counted by a checkpoint is in
    /// one of its export files.
    async fn persist(
        &self,
        ctx: &JobContext,
        batch: Batch,
        unsaved: &mut Vec<RowResult>,
        saved_files: &mut Vec<String>,
    ) -> bool {
        let exported = ctx
            .exporter
            .write_batch(&ctx.job_id, batch.number, unsaved.as_slice())
            .await;
        let name = match exported {
            Ok(name) => name,
            Err(e) => {
                ctx.logger
                    .error(
                        "Failed to export batch, keeping the previous checkpoint",
                        Some(json!({
                            "batchNumber": batch.number,
                            "pendingRows": unsaved.len(),
                            "error": e.to_string(),
                        })),
                    )
                    .await;
                return false;
            }
        };
        let batch_size = unsaved.len();
        unsaved.clear();
        saved_files.push(name.clone());

        let processed = batch.aggregates.processed_count;
        let checkpoint = Checkpoint::batch_refs(batch.aggregates, saved_files.clone());
        if let Err(e) = ctx.store.save(&ctx.job_id, &checkpoint).await {
            ctx.logger
                .error(
                    "Failed to save checkpoint",
                    Some(json!({ "processedCount": processed, "error": e.to_string() })),
                )
                .await;
            return false;
        }

        ctx.logger
            .info(
                format!("Saved batch {}", batch.number),
                Some(json!({
                    "reason": format!("{:?}", batch.reason),
                    "batchSize": batch_size,
                    "totalProcessed": processed,
                })),
            )
            .await;
        let _ = ctx
            .emitter
            .send(StreamEvent::Saved {
                count: processed,
                batch_file: Some(name),
            })
            .await;
        true
    }

    async fn complete(
        &self,
        ctx: JobContext,
        job: &mut Job,
        totals: Aggregates,
        saved_files: Vec<String>,
        elapsed: u64,
    ) -> JobStatus {
        let success_rate = if totals.processed_count == 0 {
            0.0
        } else {
            totals.success_count as f64 / totals.processed_count as f64 * 100.0
        };
        ctx.logger
            .info(
                "Analysis complete",
                Some(json!({
                    "totalProcessed": totals.processed_count,
                    "totalExpected": job.total_rows,
                    "successCount": totals.success_count,
                    "failureCount": totals.failure_count,
                    "successRate": format!("{:.2}%", success_rate),
                    "totalDiseases": totals.total_diseases,
                    "totalDuration": elapsed,
                    "savedBatches": saved_files.len(),
                })),
            )
            .await;

        if let Err(e) = ctx.store.delete(&ctx.job_id).await {
            ctx.logger
                .warn("Failed to delete checkpoint", Some(json!({ "error": e.to_string() })))
                .await;
        }

        if let Err(e) = job.transition(JobStatus::Completed) {
            tracing::error!(job_id = %ctx.job_id, error = %e, "Unexpected job state");
        }
        metrics::counter!("jobs_completed_total").increment(1);

        let _ = ctx
            .emitter
            .finish(StreamEvent::Complete {
                processed: totals.processed_count,
                total: job.total_rows,
                elapsed,
                elapsed_formatted: format_duration(elapsed),
                saved_files,
            })
            .await;
        job.status()
    }

    /// `durable` is the row count the last checkpoint covers, which is where a
    /// resumed run picks up.
    async fn interrupt(
        &self,
        ctx: JobContext,
        job: &mut Job,
        totals: Aggregates,
        durable: usize,
    ) -> JobStatus {
        ctx.logger
            .warn(
                "Analysis interrupted",
                Some(json!({
                    "processedCount": totals.processed_count,
                    "checkpointed": durable,
                    "total": job.total_rows,
                })),
            )
            .await;

        if let Err(e) = job.transition(JobStatus::Interrupted) {
            tracing::error!(job_id = %ctx.job_id, error = %e, "Unexpected job state");
        }
        metrics::counter!("jobs_interrupted_total").increment(1);

        let _ = ctx
            .emitter
            .finish(StreamEvent::Error {
                message: format!(
                    "job interrupted after {} rows; resume with resumeFrom={}",
                    totals.processed_count, durable
                ),
                error_type: Some("INTERRUPTED".to_string()),
                processed_count: durable,
            })
            .await;
        job.status()
    }

    async fn fail(
        &self,
        ctx: JobContext,
        job: &mut Job,
        error: JobError,
        processed: usize,
    ) -> JobStatus {
        ctx.logger
            .error(
                error.to_string(),
                Some(json!({ "errorType": error.error_type(), "processedCount": processed })),
            )
            .await;

        if let Err(e) = job.transition(JobStatus::Errored) {
            tracing::error!(job_id = %ctx.job_id, error = %e, "Unexpected job state");
        }
        metrics::counter!("jobs_failed_total").increment(1);

        let _ = ctx.emitter.finish(terminal_error(&error, processed)).await;
        job.status()
    }
}

/// Await a job task. If it panicked before sending its terminal event, the
/// stream is closed with an `INTERNAL` error carrying the rows done so far.
pub async fn supervise(
    job: JoinHandle<JobStatus>,
    emitter: EventEmitter,
    processed: Arc<AtomicUsize>,
) -> JobStatus {
    match job.await {
        Ok(status) => status,
        Err(e) => {
            tracing::error!(error = %e, "Job task failed");
            metrics::counter!("jobs_failed_total").increment(1);
            if !emitter.is_finished() {
                let error = JobError::Internal(e.to_string());
                let _ = emitter
                    .finish(terminal_error(&error, processed.load(Ordering::Relaxed)))
                    .await;
            }
            JobStatus::Errored
        }
    }
}

fn terminal_error(error: &JobError, processed: usize) -> StreamEvent {
    StreamEvent::Error {
        message: error.to_string(),
        error_type: Some(error.error_type().to_string()),
        processed_count: processed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TableInput {
        TableInput {
            headers: vec!["编号".into(), "诊断".into()],
            records: vec![
                vec!["1".into(), "感冒".into()],
                vec!["2".into(), "   ".into()],
                vec!["3".into()],
                vec!["4".into(), "糖尿病".into()],
            ],
        }
    }

    #[test]
    fn test_extract_rows_drops_blank_cells() {
        let rows = RowSource::Rows(vec!["感冒".into(), "".into(), "  ".into(), "咳嗽".into()])
            .extract()
            .unwrap();
        assert_eq!(rows, vec!["感冒", "咳嗽"]);
    }

    #[test]
    fn test_extract_table_column() {
        let rows = RowSource::Table {
            table: table(),
            column: "诊断".into(),
        }
        .extract()
        .unwrap();
        assert_eq!(rows, vec!["感冒", "糖尿病"]);
    }

    #[test]
    fn test_missing_column_and_empty_input() {
        let missing = RowSource::Table {
            table: table(),
            column: "主诉".into(),
        }
        .extract()
        .unwrap_err();
        assert_eq!(missing, JobError::MissingColumn("主诉".into()));
        assert_eq!(missing.error_type(), "MISSING_COLUMN");

        let empty = RowSource::Rows(vec![" ".into()]).extract().unwrap_err();
        assert_eq!(empty.error_type(), "EMPTY_INPUT");
    }

    #[test]
    fn test_job_request_requires_one_source() {
        let err = JobRequest::try_from(AnalyzeRequest::default()).unwrap_err();
        assert_eq!(err.error_type(), "INVALID_INPUT");

        let req = AnalyzeRequest {
            table: Some(table()),
            ..Default::default()
        };
        assert!(JobRequest::try_from(req).is_err());

        let req = AnalyzeRequest {
            rows: Some(vec!["感冒".into()]),
            resume_from: Some(100),
            ..Default::default()
        };
        let job = JobRequest::try_from(req).unwrap();
        assert_eq!(job.resume_from, 100);
        assert!(matches!(job.source, RowSource::Rows(_)));
    }

    #[test]
    fn test_registry_conflict_and_release() {
        let registry = JobRegistry::new();
        let token = CancellationToken::new();

        let guard = registry.register("42", token.clone()).unwrap();
        assert!(registry.is_running("42"));
        assert!(matches!(
            registry.register("42", CancellationToken::new()),
            Err(JobError::Conflict(_))
        ));

        assert!(registry.cancel("42"));
        assert!(token.is_cancelled());
        assert!(!registry.cancel("missing"));

        drop(guard);
        assert!(!registry.is_running("42"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_job_paths() {
        let paths = JobPaths::new(Path::new("/data"));
        assert_eq!(paths.log_file("7"), PathBuf::from("/data/logs/analysis-7.log"));
        assert_eq!(paths.checkpoints_dir, PathBuf::from("/data/checkpoints"));
    }
}
