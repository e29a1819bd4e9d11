use serde::{Deserialize, Serialize};

use super::log::LogRecord;
use super::row::RowResult;

/// One frame of the job stream. Serialized as a single JSON object tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum StreamEvent {
    Start {
        job_id: String,
    },
    Total {
        count: usize,
    },
    Resume {
        count: usize,
        message: String,
    },
    Progress {
        processed: usize,
        total: usize,
        percentage: u32,
        elapsed: u64,
        elapsed_formatted: String,
    },
    Result(ResultEvent),
    Saved {
        count: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        batch_file: Option<String>,
    },
    Heartbeat {
        timestamp: i64,
        processed: usize,
    },
    Log(LogRecord),
    Complete {
        processed: usize,
        total: usize,
        elapsed: u64,
        elapsed_formatted: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        saved_files: Vec<String>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_type: Option<String>,
        processed_count: usize,
    },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Complete { .. } | StreamEvent::Error { .. })
    }

    pub fn progress(processed: usize, total: usize, elapsed_ms: u64) -> Self {
        let percentage = if total == 0 {
            100
        } else {
            ((processed as f64 / total as f64) * 100.0).round() as u32
        };
        StreamEvent::Progress {
            processed,
            total,
            percentage,
            elapsed: elapsed_ms,
            elapsed_formatted: format_duration(elapsed_ms),
        }
    }

    /// Encode as one newline-terminated frame.
    pub fn to_frame(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut frame = serde_json::to_vec(self)?;
        frame.push(b'\n');
        Ok(frame)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResultEvent {
    pub index: usize,
    pub original_text: String,
    pub diseases: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    pub processing_time: u64,
    pub processing_time_formatted: String,
}

impl From<&RowResult> for ResultEvent {
    fn from(result: &RowResult) -> Self {
        Self {
            index: result.index,
            original_text: result.original_text.clone(),
            diseases: result.diseases.clone(),
            error: result.error_label(),
            error_type: result.error.map(|kind| kind.to_string()),
            retryable: result.error.map(|_| result.retryable),
            processing_time: result.processing_time_ms,
            processing_time_formatted: format_duration(result.processing_time_ms),
        }
    }
}

/// Human-readable duration using the largest two units: `1天2小时`, `3小时4分钟`, `5分6秒`, `7秒`.
pub fn format_duration(ms: u64) -> String {
    let seconds = ms / 1000;
    let minutes = seconds / 60;
    let hours = minutes / 60;
    let days = hours / 24;

    if days > 0 {
        format!("{}天{}小时", days, hours % 24)
    } else if hours > 0 {
        format!("{}小时{}分钟", hours, minutes % 60)
    } else if minutes > 0 {
        format!("{}分{}秒", minutes, seconds % 60)
    } else {
        format!("{}秒", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::row::{ErrorKind, RowTask};

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(999), "0秒");
        assert_eq!(format_duration(59_000), "59秒");
        assert_eq!(format_duration(61_000), "1分1秒");
        assert_eq!(format_duration(3_660_000), "1小时1分钟");
        assert_eq!(format_duration(90_000_000), "1天1小时");
    }

    #[test]
    fn test_event_tagging() {
        let start = serde_json::to_value(StreamEvent::Start { job_id: "42".into() }).unwrap();
        assert_eq!(start, serde_json::json!({"type": "start", "jobId": "42"}));

        let progress = serde_json::to_value(StreamEvent::progress(50, 200, 61_000)).unwrap();
        assert_eq!(progress["type"], "progress");
        assert_eq!(progress["percentage"], 25);
        assert_eq!(progress["elapsedFormatted"], "1分1秒");
    }

    #[test]
    fn test_failed_result_event() {
        let task = RowTask::new(3, "头痛");
        let row = RowResult::failure(
            &task,
            ErrorKind::LlmTimeout,
            "LLM call timeout after 15000ms",
            true,
            1200,
        );
        let value = serde_json::to_value(StreamEvent::Result(ResultEvent::from(&row))).unwrap();

        assert_eq!(value["type"], "result");
        assert_eq!(value["index"], 3);
        assert_eq!(value["errorType"], "LLM_TIMEOUT");
        assert_eq!(value["error"], "LLM_TIMEOUT: LLM call timeout after 15000ms");
        assert_eq!(value["retryable"], true);
        assert_eq!(value["diseases"], serde_json::json!([]));
    }

    #[test]
    fn test_successful_result_omits_error_fields() {
        let task = RowTask::new(0, "感冒");
        let row = RowResult::success(&task, vec!["感冒".into()], 20);
        let value = serde_json::to_value(StreamEvent::Result(ResultEvent::from(&row))).unwrap();

        assert!(value.get("error").is_none());
        assert!(value.get("errorType").is_none());
        assert!(value.get("retryable").is_none());
        assert_eq!(value["processingTimeFormatted"], "0秒");
    }

    #[test]
    fn test_frame_is_newline_terminated() {
        let frame = StreamEvent::Total { count: 3 }.to_frame().unwrap();
        assert_eq!(frame.last(), Some(&b'\n'));
        let parsed: StreamEvent = serde_json::from_slice(&frame).unwrap();
        assert_eq!(parsed, StreamEvent::Total { count: 3 });
    }
}
