use crate::types::{Materialization, MaterializationRecord, RunRecord};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("node '{node}' has no materialization in run '{run_id}'")]
    NotMaterialized { run_id: String, node: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("backend failure: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

pub type SharedMaterializationStore = Arc<dyn MaterializationStore>;

/// Keyed by `(run_id, node)`. The store never interprets output references.
///
/// Ordering between a `put` and the reads of dependent nodes is the
/// scheduler's job; the store only guarantees that a completed `put` is
/// visible to every later call.
#[async_trait::async_trait]
pub trait MaterializationStore: Send + Sync {
    /// Records `record` for `(run_id, node)`, replacing any existing entry.
    async fn put(
        &self,
        run_id: &str,
        node: &str,
        record: MaterializationRecord,
    ) -> StoreResult<Materialization>;

    /// Fails with [`StoreError::NotMaterialized`] when nothing was recorded.
    async fn get(&self, run_id: &str, node: &str) -> StoreResult<Materialization>;

    /// Most recent successful materialization of `node` across all runs.
    async fn latest(&self, node: &str) -> StoreResult<Option<Materialization>>;

    async fn list_run(&self, run_id: &str) -> StoreResult<Vec<Materialization>>;

    async fn save_run(&self, run: RunRecord) -> StoreResult<()>;

    async fn get_run(&self, run_id: &str) -> StoreResult<Option<RunRecord>>;

    /// The run most recently passed to `save_run`.
    async fn latest_run(&self) -> StoreResult<Option<RunRecord>>;
}
