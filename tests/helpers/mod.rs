//! Test helper utilities: a deterministic LLM stub, settings and stream readers

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;

use disease_extract::app_state::{AppState, LlmFactory};
use disease_extract::config::{AppConfig, JobSettings, RetryPolicy};
use disease_extract::models::event::{ResultEvent, StreamEvent};
use disease_extract::services::job::JobRegistry;
use disease_extract::services::llm::{ChatMessage, InvokeOptions, LlmError, LlmResponse, LlmService};

use crate::fixtures::DiseaseCase;

/// Deterministic model stand-in.
///
/// Replies from a fixed text->reply table, echoing `[text]` for unknown rows.
/// Optional per-call latency is pseudo-random but reproducible.
pub struct StubLlm {
    replies: HashMap<String, String>,
    failing: HashSet<String>,
    max_latency_ms: u64,
    rng: Mutex<StdRng>,
    calls: AtomicUsize,
    seen: Mutex<Vec<String>>,
    hooks: Vec<(usize, CallHook)>,
}

type CallHook = Box<dyn Fn() + Send + Sync>;

impl StubLlm {
    pub fn new() -> Self {
        Self {
            replies: HashMap::new(),
            failing: HashSet::new(),
            max_latency_ms: 0,
            rng: Mutex::new(StdRng::seed_from_u64(0x2545_f491_4f6c_dd1d)),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            hooks: Vec::new(),
        }
    }

    pub fn with_cases(mut self, cases: &[DiseaseCase]) -> Self {
        for case in cases {
            self.replies.insert(case.text.to_string(), case.reply.to_string());
        }
        self
    }

    pub fn with_random_latency(mut self, max_ms: u64) -> Self {
        self.max_latency_ms = max_ms;
        self
    }

    /// Rows whose every attempt fails with an API error.
    pub fn failing_on(mut self, text: &str) -> Self {
        self.failing.insert(text.to_string());
        self
    }

    /// Run `hook` when call number `call` (1-based) starts.
    pub fn on_call(mut self, call: usize, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.hooks.push((call, Box::new(hook)));
        self
    }

    /// Cancel `job_id` through the registry once `calls` calls have started.
    pub fn cancel_after(self, calls: usize, registry: JobRegistry, job_id: &str) -> Self {
        let job_id = job_id.to_string();
        self.on_call(calls, move || {
            registry.cancel(&job_id);
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen_texts(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    fn next_latency(&self) -> Duration {
        if self.max_latency_ms == 0 {
            return Duration::ZERO;
        }
        let ms = self.rng.lock().unwrap().random_range(0..=self.max_latency_ms);
        Duration::from_millis(ms)
    }
}

/// The row text inside the user prompt.
pub fn row_text(messages: &[ChatMessage]) -> String {
    let user = &messages[messages.len() - 1].content;
    let after = user.split_once("文本：").map(|(_, t)| t).unwrap_or(user);
    after.split("\n\n额外要求：").next().unwrap_or(after).to_string()
}

#[async_trait]
impl LlmService for StubLlm {
    async fn invoke(
        &self,
        messages: &[ChatMessage],
        _options: &InvokeOptions,
    ) -> Result<LlmResponse, LlmError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        for (at, hook) in &self.hooks {
            if *at == call {
                hook();
            }
        }

        let text = row_text(messages);
        self.seen.lock().unwrap().push(text.clone());

        let latency = self.next_latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if self.failing.contains(&text) {
            return Err(LlmError::Api {
                status: 500,
                body: "upstream unavailable".to_string(),
            });
        }

        let content = self
            .replies
            .get(&text)
            .cloned()
            .unwrap_or_else(|| format!("[{}]", text));
        Ok(LlmResponse {
            content,
            model: "stub".to_string(),
            usage: None,
        })
    }
}

/// Fast settings for tests: tiny retry delay, no production-sized intervals.
pub fn test_settings(concurrency: usize, save_interval: usize) -> JobSettings {
    JobSettings {
        concurrency,
        retry: RetryPolicy {
            max_retries: 2,
            retry_delay: Duration::from_millis(5),
            attempt_timeout: Duration::from_secs(5),
        },
        save_interval,
        heartbeat_batch_interval: 2,
        stream_buffer_size: 1024,
        temperature: 0.3,
    }
}

pub fn test_config(data_dir: &Path) -> AppConfig {
    AppConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        data_dir: data_dir.to_path_buf(),
        llm_api_key: "sk-test".to_string(),
        llm_model_id: "deepseek/deepseek-chat".to_string(),
        llm_base_url: None,
        llm_temperature: 0.3,
        concurrency: 2,
        max_retries: 1,
        retry_delay_ms: 5,
        attempt_timeout_ms: 5_000,
        save_interval: 2,
        heartbeat_batch_interval: 5,
        retry_single_max_retries: 1,
        stream_buffer_size: 256,
        max_body_bytes: 1024 * 1024,
    }
}

/// Accepts exactly one key; everything else is rejected like a 401.
pub struct KeyCheckLlm {
    key: String,
}

pub const VALID_KEY: &str = "sk-valid-0123456789abcdef";

#[async_trait]
impl LlmService for KeyCheckLlm {
    async fn invoke(
        &self,
        _messages: &[ChatMessage],
        _options: &InvokeOptions,
    ) -> Result<LlmResponse, LlmError> {
        if self.key == VALID_KEY {
            Ok(LlmResponse {
                content: "OK".to_string(),
                model: "stub".to_string(),
                usage: None,
            })
        } else {
            Err(LlmError::Api {
                status: 401,
                body: "invalid api key".to_string(),
            })
        }
    }
}

pub fn key_check_factory() -> LlmFactory {
    Arc::new(|_model_id: &str, api_key: &str| {
        Ok(Arc::new(KeyCheckLlm {
            key: api_key.to_string(),
        }) as Arc<dyn LlmService>)
    })
}

pub fn test_state(data_dir: &Path, llm: Arc<dyn LlmService>) -> AppState {
    AppState::new(&test_config(data_dir), llm, key_check_factory())
}

/// Drain a job stream up to and including its terminal event.
pub async fn collect_events(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            break;
        }
    }
    events
}

pub fn parse_ndjson(body: &[u8]) -> Vec<StreamEvent> {
    std::str::from_utf8(body)
        .expect("stream is UTF-8")
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_str(line).expect("each line is one event"))
        .collect()
}

pub fn results(events: &[StreamEvent]) -> Vec<ResultEvent> {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Result(r) => Some(r.clone()),
            _ => None,
        })
        .collect()
}

pub fn count_of(events: &[StreamEvent], kind: &str) -> usize {
    events
        .iter()
        .filter(|e| {
            serde_json::to_value(e)
                .map(|v| v["type"] == kind)
                .unwrap_or(false)
        })
        .count()
}
