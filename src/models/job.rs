use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

/// Lifecycle of an extraction job.
///
/// `Created -> Running -> {Completed | Interrupted | Errored}`; a job may also
/// error before it starts running (invalid input).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Created,
    Running,
    Completed,
    Interrupted,
    Errored,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Interrupted | JobStatus::Errored)
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Created, Errored)
                | (Running, Completed)
                | (Running, Interrupted)
                | (Running, Errored)
        )
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
#[error("invalid job transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// One run over a row set, identified by a job id that is stable across resumes.
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: String,
    pub total_rows: usize,
    pub resume_offset: usize,
    pub started_at: DateTime<Utc>,
    status: JobStatus,
}

impl Job {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            total_rows: 0,
            resume_offset: 0,
            started_at: Utc::now(),
            status: JobStatus::Created,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn transition(&mut self, next: JobStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}

/// Server-assigned job id when the client supplies none: current time in milliseconds.
pub fn generate_job_id() -> String {
    Utc::now().timestamp_millis().to_string()
}
