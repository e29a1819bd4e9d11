//! Group-barrier batch scheduler.
//!
//! Rows from the resume offset onward are cut into consecutive groups of
//! `concurrency`. Every row of a group runs concurrently; the next group only
//! starts once the whole group has finished. All counters and the result
//! buffer are owned by the scheduler and only touched between groups.
//!
//! Cancellation is observed at group boundaries. A group that is already
//! running always completes, its results are emitted, and the buffer is
//! flushed as a final checkpoint before the scheduler reports `Cancelled`.

use std::sync::Arc;

use chrono::Utc;
use futures::Stream;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::models::row::{Aggregates, ErrorKind, RowResult, RowTask};
use crate::services::invoker::RetryableInvoker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub concurrency: usize,
    pub save_interval: usize,
    pub heartbeat_batch_interval: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 20,
            save_interval: 100,
            heartbeat_batch_interval: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointReason {
    /// `save_interval` rows accumulated since the previous checkpoint.
    Interval,
    /// Last rows of the job.
    Final,
    /// Rows finished before cancellation took effect.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// One finished row. Emitted in increasing index order.
    Result(RowResult),
    /// Snapshot to persist. `results` holds the rows since the previous checkpoint.
    Checkpoint {
        aggregates: Aggregates,
        results: Vec<RowResult>,
        batch_number: usize,
        reason: CheckpointReason,
    },
    Progress {
        processed: usize,
    },
    Heartbeat {
        timestamp: i64,
        processed: usize,
    },
    /// Always the last event.
    Finished {
        outcome: Outcome,
        aggregates: Aggregates,
    },
}

/// Drives one job's rows. Not restartable: build a new one per run.
pub struct BatchScheduler {
    rows: Arc<[String]>,
    next_index: usize,
    invoker: RetryableInvoker,
    config: SchedulerConfig,
    aggregates: Aggregates,
    buffer: Vec<RowResult>,
    batch_number: usize,
    groups_done: usize,
    cancel: CancellationToken,
    finished: bool,
}

impl BatchScheduler {
    pub fn new(
        rows: Arc<[String]>,
        invoker: RetryableInvoker,
        config: SchedulerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            rows,
            next_index: 0,
            invoker,
            config: SchedulerConfig {
                concurrency: config.concurrency.max(1),
                save_interval: config.save_interval.max(1),
                heartbeat_batch_interval: config.heartbeat_batch_interval.max(1),
            },
            aggregates: Aggregates::default(),
            buffer: Vec::new(),
            batch_number: 1,
            groups_done: 0,
            cancel,
            finished: false,
        }
    }

    /// Continue after `restored.processed_count` rows, numbering new export
    /// batches from `next_batch_number`.
    pub fn resume_from(mut self, restored: Aggregates, next_batch_number: usize) -> Self {
        self.next_index = restored.processed_count.min(self.rows.len());
        self.aggregates = Aggregates {
            processed_count: self.next_index,
            ..restored
        };
        self.batch_number = next_batch_number.max(1);
        self
    }

    pub fn aggregates(&self) -> Aggregates {
        self.aggregates
    }

    /// Run the next group and return its events, or `None` once finished.
    pub async fn next_group(&mut self) -> Option<Vec<SchedulerEvent>> {
        if self.finished {
            return None;
        }

        let remaining = self.next_index < self.rows.len();
        if !remaining || self.cancel.is_cancelled() {
            self.finished = true;
            let (outcome, reason) = if remaining {
                (Outcome::Cancelled, CheckpointReason::Cancelled)
            } else {
                (Outcome::Completed, CheckpointReason::Final)
            };
            let mut events = Vec::with_capacity(2);
            if !self.buffer.is_empty() {
                events.push(self.take_checkpoint(reason));
            }
            events.push(SchedulerEvent::Finished {
                outcome,
                aggregates: self.aggregates,
            });
            return Some(events);
        }

        let start = self.next_index;
        let end = (start + self.config.concurrency).min(self.rows.len());
        let results = self.run_group(start, end).await;
        self.next_index = end;
        self.groups_done += 1;

        let mut events = Vec::with_capacity(results.len() + 3);
        for result in results {
            self.aggregates.record(&result);
            events.push(SchedulerEvent::Result(result.clone()));
            self.buffer.push(result);
        }

        if self.buffer.len() >= self.config.save_interval {
            events.push(self.take_checkpoint(CheckpointReason::Interval));
            events.push(SchedulerEvent::Progress {
                processed: self.aggregates.processed_count,
            });
        }

        if self.groups_done % self.config.heartbeat_batch_interval == 0 {
            events.push(SchedulerEvent::Heartbeat {
                timestamp: Utc::now().timestamp_millis(),
                processed: self.aggregates.processed_count,
            });
        }

        Some(events)
    }

    /// Flatten the scheduler into a lazy event stream.
    pub fn into_stream(self) -> impl Stream<Item = SchedulerEvent> {
        use futures::StreamExt;

        futures::stream::unfold(self, |mut scheduler| async move {
            let events = scheduler.next_group().await?;
            Some((futures::stream::iter(events), scheduler))
        })
        .flatten()
    }

    fn take_checkpoint(&mut self, reason: CheckpointReason) -> SchedulerEvent {
        let event = SchedulerEvent::Checkpoint {
            aggregates: self.aggregates,
            results: std::mem::take(&mut self.buffer),
            batch_number: self.batch_number,
            reason,
        };
        self.batch_number += 1;
        event
    }

    /// Run rows `start..end` concurrently and return exactly one result per
    /// row, sorted by index.
    async fn run_group(&self, start: usize, end: usize) -> Vec<RowResult> {
        let mut set = JoinSet::new();
        for index in start..end {
            let invoker = self.invoker.clone();
            let task = RowTask::new(index, self.rows[index].clone());
            set.spawn(async move { invoker.run(task).await });
        }

        let mut results = Vec::with_capacity(end - start);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => tracing::error!(error = %e, "Row task aborted"),
            }
        }

        // A task that panicked left a hole; fill it so every row still reports.
        if results.len() < end - start {
            let mut seen = vec![false; end - start];
            for result in &results {
                seen[result.index - start] = true;
            }
            for (offset, _) in seen.iter().enumerate().filter(|(_, seen)| !**seen) {
                let task = RowTask::new(start + offset, self.rows[start + offset].clone());
                results.push(RowResult::failure(
                    &task,
                    ErrorKind::Unknown,
                    "row task terminated unexpectedly",
                    false,
                    0,
                ));
            }
        }

        results.sort_by_key(|r| r.index);
        results
    }
}
