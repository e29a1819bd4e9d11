use std::path::{Path, PathBuf};

use crate::models::row::RowResult;

const CSV_HEADERS: [&str; 4] = ["序号", "原始文本", "识别到的病种", "状态"];

/// Writes checkpoint batches as CSV files under one directory and resolves
/// download names back to paths.
#[derive(Debug, Clone)]
pub struct BatchExporter {
    dir: PathBuf,
}

impl BatchExporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_name(batch_number: usize, job_id: &str) -> String {
        format!("batch-{}-{}.csv", batch_number, job_id)
    }

    /// Write one batch and return its file name (relative to the export dir).
    pub async fn write_batch(
        &self,
        job_id: &str,
        batch_number: usize,
        results: &[RowResult],
    ) -> Result<String, ExportError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let name = Self::file_name(batch_number, job_id);
        tokio::fs::write(self.dir.join(&name), render_csv(results)).await?;
        tracing::debug!(job_id, batch_number, rows = results.len(), file = %name, "Batch exported");
        Ok(name)
    }

    /// Map a client-supplied name to a file inside the export dir.
    pub fn resolve(&self, name: &str) -> Result<PathBuf, ExportError> {
        let safe = !name.is_empty()
            && !name.contains("..")
            && !name.contains('/')
            && !name.contains('\\')
            && name.ends_with(".csv");
        if !safe {
            return Err(ExportError::InvalidName(name.to_string()));
        }
        Ok(self.dir.join(name))
    }
}

/// Render results as CSV. Row numbers are 1-based.
pub fn render_csv(results: &[RowResult]) -> String {
    let mut out = CSV_HEADERS.join(",");
    for result in results {
        let status = match result.error_label() {
            Some(label) => format!("失败: {}", label),
            None => "成功".to_string(),
        };
        out.push('\n');
        out.push_str(&(result.index + 1).to_string());
        out.push(',');
        out.push_str(&quote(&result.original_text));
        out.push(',');
        out.push_str(&quote(&result.diseases.join("; ")));
        out.push(',');
        out.push_str(&quote(&status));
    }
    out.push('\n');
    out
}

fn quote(field: &str) -> String {
    format!("\"{}\"", field.replace('"', "\"\""))
}

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("Export I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid export file name: {0}")]
    InvalidName(String),
}
