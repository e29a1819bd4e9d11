use serde::{Deserialize, Serialize};

use super::row::{Aggregates, RowResult};

/// Durable progress snapshot for one job.
///
/// New checkpoints are always written as `BatchRefs`; `FullResults` is kept so
/// files from the older full-results layout still resume.
#[derive(Debug, Clone, PartialEq)]
pub enum Checkpoint {
    FullResults {
        aggregates: Aggregates,
        results: Vec<RowResult>,
    },
    BatchRefs {
        aggregates: Aggregates,
        saved_files: Vec<String>,
    },
}

impl Checkpoint {
    pub fn batch_refs(aggregates: Aggregates, saved_files: Vec<String>) -> Self {
        Checkpoint::BatchRefs {
            aggregates,
            saved_files,
        }
    }

    pub fn aggregates(&self) -> Aggregates {
        match self {
            Checkpoint::FullResults { aggregates, .. }
            | Checkpoint::BatchRefs { aggregates, .. } => *aggregates,
        }
    }

    pub fn processed_count(&self) -> usize {
        self.aggregates().processed_count
    }

    pub fn saved_files(&self) -> &[String] {
        match self {
            Checkpoint::FullResults { .. } => &[],
            Checkpoint::BatchRefs { saved_files, .. } => saved_files,
        }
    }

    /// Number of rows the client can be told were restored.
    pub fn restored_count(&self) -> usize {
        match self {
            Checkpoint::FullResults { results, .. } => results.len(),
            Checkpoint::BatchRefs { aggregates, .. } => aggregates.processed_count,
        }
    }
}

/// On-disk layout:
/// `{processedCount, successCount, failureCount, totalDiseases, results?, savedFiles?}`.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointFile {
    pub processed_count: usize,
    #[serde(default)]
    pub success_count: usize,
    #[serde(default)]
    pub failure_count: usize,
    #[serde(default)]
    pub total_diseases: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<RowResult>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_files: Option<Vec<String>>,
}

impl From<&Checkpoint> for CheckpointFile {
    fn from(checkpoint: &Checkpoint) -> Self {
        let agg = checkpoint.aggregates();
        let mut file = CheckpointFile {
            processed_count: agg.processed_count,
            success_count: agg.success_count,
            failure_count: agg.failure_count,
            total_diseases: agg.total_diseases,
            results: None,
            saved_files: None,
        };
        match checkpoint {
            Checkpoint::FullResults { results, .. } => file.results = Some(results.clone()),
            Checkpoint::BatchRefs { saved_files, .. } => {
                file.saved_files = Some(saved_files.clone())
            }
        }
        file
    }
}

impl From<CheckpointFile> for Checkpoint {
    fn from(file: CheckpointFile) -> Self {
        match file.results {
            // Totals in full-results files may be absent, so derive them from the list.
            Some(results) if !results.is_empty() => {
                let mut aggregates = Aggregates::from_results(&results);
                aggregates.processed_count = aggregates.processed_count.max(file.processed_count);
                Checkpoint::FullResults {
                    aggregates,
                    results,
                }
            }
            _ => Checkpoint::BatchRefs {
                aggregates: Aggregates {
                    processed_count: file.processed_count,
                    success_count: file.success_count,
                    failure_count: file.failure_count,
                    total_diseases: file.total_diseases,
                },
                saved_files: file.saved_files.unwrap_or_default(),
            },
        }
    }
}
