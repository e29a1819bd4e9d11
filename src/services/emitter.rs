//! Ordered, framed push channel from a running job to its client, plus the
//! per-job logger that mirrors records into that channel.

use std::convert::Infallible;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::body::Bytes;
use futures::Stream;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::models::event::StreamEvent;
use crate::models::log::{LogLevel, LogRecord};

/// Sending half of a job stream.
///
/// Cheap to clone; the logger holds one. After [`EventEmitter::finish`] every
/// further send is dropped, so the client sees exactly one terminal event.
#[derive(Clone)]
pub struct EventEmitter {
    tx: mpsc::Sender<StreamEvent>,
    finished: Arc<AtomicBool>,
    cancel: CancellationToken,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum EmitError {
    #[error("client disconnected")]
    Disconnected,

    #[error("stream already finished")]
    Finished,

    #[error("terminal events must be sent with finish()")]
    TerminalViaSend,
}

impl EventEmitter {
    /// Create a channel of `capacity` frames. A closed receiver fires `cancel`.
    pub fn channel(
        capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let emitter = Self {
            tx,
            finished: Arc::new(AtomicBool::new(false)),
            cancel,
        };
        (emitter, rx)
    }

    /// Send a non-terminal event, waiting for buffer space.
    pub async fn send(&self, event: StreamEvent) -> Result<(), EmitError> {
        if event.is_terminal() {
            return Err(EmitError::TerminalViaSend);
        }
        if self.finished.load(Ordering::Acquire) {
            return Err(EmitError::Finished);
        }
        self.deliver(event).await
    }

    /// Send the terminal event and close the stream for every clone.
    pub async fn finish(self, event: StreamEvent) -> Result<(), EmitError> {
        if self.finished.swap(true, Ordering::AcqRel) {
            return Err(EmitError::Finished);
        }
        self.deliver(event).await
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    async fn deliver(&self, event: StreamEvent) -> Result<(), EmitError> {
        if self.tx.send(event).await.is_err() {
            if !self.cancel.is_cancelled() {
                tracing::info!("Stream receiver dropped, cancelling job");
                self.cancel.cancel();
            }
            return Err(EmitError::Disconnected);
        }
        Ok(())
    }
}

/// Turn the receiving half into NDJSON frames, ending after the terminal event.
pub fn ndjson_frames(
    rx: mpsc::Receiver<StreamEvent>,
) -> impl Stream<Item = Result<Bytes, Infallible>> {
    futures::stream::unfold((rx, false), |(mut rx, done)| async move {
        if done {
            return None;
        }
        loop {
            let event = rx.recv().await?;
            let terminal = event.is_terminal();
            match event.to_frame() {
                Ok(frame) => return Some((Ok(Bytes::from(frame)), (rx, terminal))),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to encode stream event");
                    if terminal {
                        return None;
                    }
                }
            }
        }
    })
}

/// Per-job log sink.
///
/// Every record goes to `tracing`; when attached to a job it is also appended
/// to the job's JSON-lines file and mirrored to the stream as a `log` event.
/// Sink failures are reported through `tracing` and never fail the job.
#[derive(Clone)]
pub struct JobLogger {
    job_id: Option<Arc<str>>,
    file: Option<Arc<Mutex<File>>>,
    stream: Option<EventEmitter>,
}

impl JobLogger {
    /// Logger with no durable or live sink, used by the synchronous endpoints.
    pub fn tracing_only() -> Self {
        Self {
            job_id: None,
            file: None,
            stream: None,
        }
    }

    /// Open (append) the job's log file and attach the stream. If the file
    /// cannot be opened the logger keeps its other sinks.
    pub async fn open(job_id: &str, path: &Path, stream: EventEmitter) -> Self {
        let file = match open_append(path).await {
            Ok(file) => Some(Arc::new(Mutex::new(file))),
            Err(e) => {
                tracing::error!(
                    job_id,
                    path = %path.display(),
                    error = %e,
                    "Failed to open job log file"
                );
                None
            }
        };
        Self {
            job_id: Some(Arc::from(job_id)),
            file,
            stream: Some(stream),
        }
    }

    pub async fn debug(&self, message: impl Into<String>, details: Option<serde_json::Value>) {
        self.log(LogLevel::Debug, message, details).await;
    }

    pub async fn info(&self, message: impl Into<String>, details: Option<serde_json::Value>) {
        self.log(LogLevel::Info, message, details).await;
    }

    pub async fn warn(&self, message: impl Into<String>, details: Option<serde_json::Value>) {
        self.log(LogLevel::Warn, message, details).await;
    }

    pub async fn error(&self, message: impl Into<String>, details: Option<serde_json::Value>) {
        self.log(LogLevel::Error, message, details).await;
    }

    pub async fn log(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) {
        let record = LogRecord::new(level, message, details);
        self.trace(&record);

        if let Some(file) = &self.file {
            if let Err(e) = append_line(file, &record).await {
                tracing::warn!(job_id = ?self.job_id, error = %e, "Failed to write job log file");
            }
        }

        if let Some(stream) = &self.stream {
            // A disconnected or finished stream only loses the live mirror.
            let _ = stream.send(StreamEvent::Log(record)).await;
        }
    }

    fn trace(&self, record: &LogRecord) {
        let job_id = self.job_id.as_deref().unwrap_or("-");
        let details = record.details.as_ref().map(|d| d.to_string());
        match record.level {
            LogLevel::Debug => tracing::debug!(job_id, details, "{}", record.message),
            LogLevel::Info => tracing::info!(job_id, details, "{}", record.message),
            LogLevel::Warn => tracing::warn!(job_id, details, "{}", record.message),
            LogLevel::Error => tracing::error!(job_id, details, "{}", record.message),
        }
    }
}

async fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    OpenOptions::new().create(true).append(true).open(path).await
}

async fn append_line(file: &Mutex<File>, record: &LogRecord) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    let mut file = file.lock().await;
    file.write_all(&line).await?;
    file.flush().await
}
