use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use crate::models::checkpoint::{Checkpoint, CheckpointFile};

/// Filesystem-backed checkpoints, one JSON file per job id.
///
/// Writes go to a sibling temp file that is renamed over the target, so a
/// crash mid-write leaves the previous checkpoint intact.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", job_id))
    }

    pub async fn save(&self, job_id: &str, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let target = self.path_for(job_id);
        let tmp = self.dir.join(format!("{}.json.tmp", job_id));
        let payload = serde_json::to_vec(&CheckpointFile::from(checkpoint))?;

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&payload).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &target).await?;
        tracing::debug!(job_id, processed = checkpoint.processed_count(), "Checkpoint saved");
        Ok(())
    }

    /// Load the job's checkpoint.
    ///
    /// Missing, unreadable and corrupt files all yield `None`; only the latter
    /// two are logged.
    pub async fn load(&self, job_id: &str) -> Option<Checkpoint> {
        let path = self.path_for(job_id);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == IoErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(
                    job_id,
                    path = %path.display(),
                    error = %e,
                    "Failed to read checkpoint"
                );
                return None;
            }
        };

        match serde_json::from_slice::<CheckpointFile>(&raw) {
            Ok(file) => Some(Checkpoint::from(file)),
            Err(e) => {
                tracing::warn!(
                    job_id,
                    path = %path.display(),
                    error = %e,
                    "Ignoring corrupt checkpoint"
                );
                None
            }
        }
    }

    /// Remove the job's checkpoint; a missing file is not an error.
    pub async fn delete(&self, job_id: &str) -> Result<(), CheckpointError> {
        match tokio::fs::remove_file(self.path_for(job_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checkpoint serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::row::{Aggregates, RowResult, RowTask};

    fn aggregates(processed: usize) -> Aggregates {
        Aggregates {
            processed_count: processed,
            success_count: processed,
            failure_count: 0,
            total_diseases: processed * 2,
        }
    }

    #[tokio::test]
    async fn test_save_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("checkpoints"));

        assert!(store.load("job").await.is_none());

        let first = Checkpoint::batch_refs(aggregates(100), vec!["batch-1-job.csv".into()]);
        store.save("job", &first).await.unwrap();
        let second = Checkpoint::batch_refs(
            aggregates(200),
            vec!["batch-1-job.csv".into(), "batch-2-job.csv".into()],
        );
        store.save("job", &second).await.unwrap();

        assert_eq!(store.load("job").await, Some(second));
        assert!(!dir.path().join("checkpoints").join("job.json.tmp").exists());

        store.delete("job").await.unwrap();
        assert!(store.load("job").await.is_none());
        // deleting twice is fine
        store.delete("job").await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        tokio::fs::write(store.path_for("bad"), b"{\"processedCount\": tr").await.unwrap();

        assert!(store.load("bad").await.is_none());
    }

    #[tokio::test]
    async fn test_interrupted_write_keeps_previous_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let good = Checkpoint::batch_refs(aggregates(100), vec![]);
        store.save("job", &good).await.unwrap();

        // a half-written temp file from a crashed save
        tokio::fs::write(dir.path().join("job.json.tmp"), b"{\"proc").await.unwrap();

        assert_eq!(store.load("job").await, Some(good));
    }

    #[tokio::test]
    async fn test_loads_full_results_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let results = vec![
            RowResult::success(&RowTask::new(0, "感冒"), vec!["感冒".into()], 3),
            RowResult::success(&RowTask::new(1, "咳嗽"), vec![], 3),
        ];
        let raw = serde_json::json!({ "results": results, "processedCount": 2 });
        tokio::fs::write(store.path_for("legacy"), raw.to_string()).await.unwrap();

        let checkpoint = store.load("legacy").await.unwrap();
        assert!(matches!(checkpoint, Checkpoint::FullResults { .. }));
        assert_eq!(checkpoint.processed_count(), 2);
    }
}
