//! Per-row LLM call with bounded retries and a per-attempt deadline.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::config::RetryPolicy;
use crate::models::row::{ErrorKind, RowResult, RowTask};
use crate::services::emitter::JobLogger;
use crate::services::llm::{InvokeOptions, LlmService};
use crate::services::parser::DiseaseParser;
use crate::services::prompt;

#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
#[error("LLM call timeout after {}ms", .0.as_millis())]
pub struct DeadlineExceeded(pub Duration);

/// Race `op` against `timeout`.
///
/// On deadline the operation is dropped, so a late result can never be
/// observed, and `cancel` is fired so the operation can stop its own work.
pub async fn with_deadline<F, T>(
    timeout: Duration,
    cancel: CancellationToken,
    op: F,
) -> Result<T, DeadlineExceeded>
where
    F: Future<Output = T>,
{
    match tokio::time::timeout(timeout, op).await {
        Ok(value) => Ok(value),
        Err(_) => {
            cancel.cancel();
            Err(DeadlineExceeded(timeout))
        }
    }
}

/// Result of one row plus the last raw reply, for callers that show it.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub result: RowResult,
    pub raw_response: Option<String>,
}

/// Drives one row through the LLM with retries.
///
/// Failures never escape: after the budget is spent the row becomes a
/// retryable failed [`RowResult`].
#[derive(Clone)]
pub struct RetryableInvoker {
    llm: Arc<dyn LlmService>,
    parser: DiseaseParser,
    policy: RetryPolicy,
    temperature: Option<f32>,
    system_prompt: Option<String>,
    user_prompt: Option<String>,
    logger: JobLogger,
}

impl RetryableInvoker {
    pub fn new(llm: Arc<dyn LlmService>, policy: RetryPolicy, logger: JobLogger) -> Self {
        Self {
            llm,
            parser: DiseaseParser::default(),
            policy,
            temperature: None,
            system_prompt: None,
            user_prompt: None,
            logger,
        }
    }

    pub fn with_prompts(
        mut self,
        system_prompt: Option<String>,
        user_prompt: Option<String>,
    ) -> Self {
        self.system_prompt = system_prompt;
        self.user_prompt = user_prompt;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_parser(mut self, parser: DiseaseParser) -> Self {
        self.parser = parser;
        self
    }

    pub async fn run(&self, task: RowTask) -> RowResult {
        self.run_detailed(task).await.result
    }

    pub async fn run_detailed(&self, mut task: RowTask) -> Invocation {
        let started = Instant::now();
        let messages = prompt::build_messages(
            &task.text,
            self.system_prompt.as_deref(),
            self.user_prompt.as_deref(),
        );

        loop {
            let cancel = CancellationToken::new();
            let options = InvokeOptions {
                temperature: self.temperature,
                cancel: cancel.clone(),
                ..Default::default()
            };

            let attempt_started = Instant::now();
            let call = self.llm.invoke(&messages, &options);
            let outcome = with_deadline(self.policy.attempt_timeout, cancel, call).await;
            metrics::counter!("llm_attempts_total").increment(1);
            metrics::histogram!("llm_attempt_seconds")
                .record(attempt_started.elapsed().as_secs_f64());

            let error_message = match outcome {
                Ok(Ok(response)) => {
                    let diseases = self.parser.parse(&response.content);
                    let elapsed = started.elapsed().as_millis() as u64;
                    tracing::debug!(
                        index = task.index,
                        attempt = task.attempt,
                        found = diseases.len(),
                        "Row analysed"
                    );
                    return Invocation {
                        result: RowResult::success(&task, diseases, elapsed),
                        raw_response: Some(response.content),
                    };
                }
                Ok(Err(e)) => e.to_string(),
                Err(deadline) => deadline.to_string(),
            };
            let kind = ErrorKind::classify(&error_message);
            let retrying = task.attempt < self.policy.max_retries;

            let message = if retrying {
                format!(
                    "Row {} attempt {}/{} failed, retrying in {}ms",
                    task.index,
                    task.attempt + 1,
                    self.policy.max_retries + 1,
                    self.policy.retry_delay.as_millis()
                )
            } else {
                format!(
                    "Row {} attempt {}/{} failed",
                    task.index,
                    task.attempt + 1,
                    self.policy.max_retries + 1
                )
            };
            self.logger
                .warn(
                    message,
                    Some(json!({
                        "index": task.index,
                        "attempt": task.attempt,
                        "errorType": kind,
                        "error": error_message,
                    })),
                )
                .await;

            if retrying {
                tokio::time::sleep(self.policy.retry_delay).await;
                task.attempt += 1;
                continue;
            }

            self.logger
                .error(
                    format!("Row {} failed after {} attempts", task.index, task.attempt + 1),
                    Some(json!({
                        "index": task.index,
                        "errorType": kind,
                        "error": error_message,
                        "text": task.text,
                    })),
                )
                .await;
            metrics::counter!("row_failures_total", "error_type" => kind.to_string())
                .increment(1);

            let elapsed = started.elapsed().as_millis() as u64;
            return Invocation {
                result: RowResult::failure(&task, kind, error_message, true, elapsed),
                raw_response: None,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::event::StreamEvent;
    use crate::models::log::LogLevel;
    use crate::services::emitter::EventEmitter;
    use crate::services::llm::{ChatMessage, LlmError, LlmResponse};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls, then answers `reply`.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        reply: &'static str,
        error: fn() -> LlmError,
    }

    #[async_trait]
    impl LlmService for Flaky {
        async fn invoke(
            &self,
            _: &[ChatMessage],
            _: &InvokeOptions,
        ) -> Result<LlmResponse, LlmError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err((self.error)());
            }
            Ok(LlmResponse {
                content: self.reply.to_string(),
                model: "stub".into(),
                usage: None,
            })
        }
    }

    /// Never answers before the deadline; records whether it was told to stop.
    struct Hanging {
        cancelled: Arc<AtomicU32>,
    }

    #[async_trait]
    impl LlmService for Hanging {
        async fn invoke(
            &self,
            _: &[ChatMessage],
            options: &InvokeOptions,
        ) -> Result<LlmResponse, LlmError> {
            let cancelled = self.cancelled.clone();
            let token = options.cancel.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                cancelled.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(LlmResponse {
                content: "[迟到]".into(),
                model: "stub".into(),
                usage: None,
            })
        }
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            retry_delay: Duration::from_millis(2000),
            attempt_timeout: Duration::from_millis(15_000),
        }
    }

    fn api_error() -> LlmError {
        LlmError::Api {
            status: 503,
            body: "overloaded".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_passes_through_fast_result() {
        let cancel = CancellationToken::new();
        let value = with_deadline(Duration::from_millis(100), cancel.clone(), async { 7 }).await;
        assert_eq!(value, Ok(7));
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fires_cancel_and_drops_late_result() {
        let cancel = CancellationToken::new();
        let slow = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            7
        };
        let value = with_deadline(Duration::from_secs(1), cancel.clone(), slow).await;
        assert_eq!(value, Err(DeadlineExceeded(Duration::from_secs(1))));
        assert!(cancel.is_cancelled());
        assert_eq!(ErrorKind::classify(&value.unwrap_err().to_string()), ErrorKind::LlmTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_fewer_failures_than_budget() {
        let llm = Arc::new(Flaky {
            failures: 3,
            calls: AtomicU32::new(0),
            reply: "[高血压, 糖尿病]",
            error: api_error,
        });
        let invoker = RetryableInvoker::new(llm.clone(), policy(5), JobLogger::tracing_only());

        let result = invoker.run(RowTask::new(4, "高血压合并糖尿病")).await;

        assert!(result.is_success());
        assert_eq!(result.index, 4);
        assert_eq!(result.diseases, vec!["高血压", "糖尿病"]);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_makes_max_retries_plus_one_attempts() {
        let llm = Arc::new(Flaky {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
            reply: "",
            error: api_error,
        });
        let invoker = RetryableInvoker::new(llm.clone(), policy(5), JobLogger::tracing_only());

        let result = invoker.run(RowTask::new(0, "头痛")).await;

        assert_eq!(llm.calls.load(Ordering::SeqCst), 6);
        assert_eq!(result.error, Some(ErrorKind::LlmCall));
        assert!(result.retryable);
        assert!(result.diseases.is_empty());
        assert_eq!(result.original_text, "头痛");
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_means_single_attempt() {
        let llm = Arc::new(Flaky {
            failures: 1,
            calls: AtomicU32::new(0),
            reply: "[感冒]",
            error: || LlmError::Parse("bad JSON".into()),
        });
        let invoker = RetryableInvoker::new(llm.clone(), policy(0), JobLogger::tracing_only());

        let result = invoker.run(RowTask::new(0, "感冒")).await;

        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.error, Some(ErrorKind::ResponseParse));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_classified_and_cancelled() {
        let cancelled = Arc::new(AtomicU32::new(0));
        let llm = Arc::new(Hanging {
            cancelled: cancelled.clone(),
        });
        let invoker = RetryableInvoker::new(llm, policy(1), JobLogger::tracing_only());

        let result = invoker.run(RowTask::new(2, "胸闷")).await;
        // let the watcher tasks observe the cancellation
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }

        assert_eq!(result.error, Some(ErrorKind::LlmTimeout));
        assert!(result.error_message.unwrap().contains("15000ms"));
        assert_eq!(cancelled.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_raw_response_returned_on_success() {
        let llm = Arc::new(Flaky {
            failures: 0,
            calls: AtomicU32::new(0),
            reply: "未识别到病种",
            error: api_error,
        });
        let invoker = RetryableInvoker::new(llm, policy(2), JobLogger::tracing_only());

        let invocation = invoker.run_detailed(RowTask::new(0, "体检未见异常")).await;

        assert!(invocation.result.is_success());
        assert!(invocation.result.diseases.is_empty());
        assert_eq!(invocation.raw_response.as_deref(), Some("未识别到病种"));
    }

    #[tokio::test]
    async fn test_every_failed_attempt_logs_warn_then_one_error() {
        let dir = tempfile::tempdir().unwrap();
        let (emitter, mut rx) = EventEmitter::channel(64, CancellationToken::new());
        let logger = JobLogger::open("7", &dir.path().join("analysis-7.log"), emitter).await;
        let llm = Arc::new(Flaky {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
            reply: "",
            error: api_error,
        });
        let fast = RetryPolicy {
            max_retries: 2,
            retry_delay: Duration::from_millis(1),
            attempt_timeout: Duration::from_secs(5),
        };
        let invoker = RetryableInvoker::new(llm.clone(), fast, logger);

        let result = invoker.run(RowTask::new(0, "头痛")).await;
        drop(invoker);

        let mut levels = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let StreamEvent::Log(record) = event {
                levels.push(record.level);
            }
        }
        assert_eq!(llm.calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.error, Some(ErrorKind::LlmCall));
        assert_eq!(
            levels,
            vec![LogLevel::Warn, LogLevel::Warn, LogLevel::Warn, LogLevel::Error]
        );
    }
}
