use crate::PipelineError;
use crate::sink::ObjectStore;
use crate::tool::{ToolCommand, TransformTool};
use bytes::Bytes;
use std::path::PathBuf;
use tempfile::TempDir;

pub const DEFAULT_EXPORT_OPERATION: &str = "export_table_to_parquet";

/// Renders one warehouse table to a local Parquet file through the
/// transformation tool, then uploads the file under a fixed key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportStep {
    pub table: String,
    pub bucket: String,
    pub key: String,
    pub operation: String,
    /// Parent for the per-call scratch directory; the system temp dir
    /// when unset.
    pub scratch_root: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportReceipt {
    pub locator: String,
    pub bytes: u64,
    pub content_hash: String,
}

impl ExportStep {
    pub fn new(
        table: impl Into<String>,
        bucket: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            bucket: bucket.into(),
            key: key.into(),
            operation: DEFAULT_EXPORT_OPERATION.to_string(),
            scratch_root: None,
        }
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }

    pub fn with_scratch_root(mut self, scratch_root: Option<PathBuf>) -> Self {
        self.scratch_root = scratch_root;
        self
    }

    /// Either the complete file lands under the key or nothing is uploaded.
    /// The scratch directory is removed on every path.
    pub async fn execute(
        &self,
        tool: &dyn TransformTool,
        storage: &dyn ObjectStore,
    ) -> Result<ExportReceipt, PipelineError> {
        let scratch = self.scratch_dir()?;
        let result = self.render_and_upload(&scratch, tool, storage).await;

        let scratch_path = scratch.path().to_path_buf();
        if let Err(err) = scratch.close() {
            tracing::warn!(path = %scratch_path.display(), error = %err, "scratch cleanup failed");
        }
        result
    }

    fn scratch_dir(&self) -> Result<TempDir, PipelineError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("strata-export-");
        let created = match self.scratch_root.as_ref() {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        };
        created.map_err(|err| PipelineError::ExportRender(format!("scratch directory: {err}")))
    }

    async fn render_and_upload(
        &self,
        scratch: &TempDir,
        tool: &dyn TransformTool,
        storage: &dyn ObjectStore,
    ) -> Result<ExportReceipt, PipelineError> {
        let output_path = scratch.path().join(format!("{}.parquet", self.table));
        let output_arg = output_path.to_string_lossy().into_owned();
        let command = ToolCommand::export_table(&self.operation, &self.table, &output_arg);

        tracing::info!(table = %self.table, operation = %self.operation, "rendering export");
        tool.invoke(&command)
            .await
            .and_then(|invocation| invocation.ensure_success(&command))
            .map_err(|err| PipelineError::ExportRender(err.to_string()))?;

        let body = match tokio::fs::read(&output_path).await {
            Ok(body) if !body.is_empty() => Bytes::from(body),
            Ok(_) => {
                return Err(PipelineError::ExportRender(format!(
                    "rendered file '{}' is empty",
                    output_path.display()
                )));
            }
            Err(err) => {
                return Err(PipelineError::ExportRender(format!(
                    "rendered file '{}' is unreadable: {err}",
                    output_path.display()
                )));
            }
        };

        let bytes = body.len() as u64;
        let content_hash = blake3::hash(&body).to_hex().to_string();
        storage
            .put(&self.bucket, &self.key, body)
            .await
            .map_err(|err| PipelineError::ExportUpload(err.to_string()))?;

        let locator = storage.locator(&self.bucket, &self.key);
        tracing::info!(locator = %locator, bytes, "export uploaded");
        Ok(ExportReceipt {
            locator,
            bytes,
            content_hash,
        })
    }
}
