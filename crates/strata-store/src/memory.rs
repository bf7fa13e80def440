use crate::store::{MaterializationStore, StoreError, StoreResult};
use crate::types::{
    Materialization, MaterializationRecord, NodeName, RunId, RunRecord, content_hash,
    timestamp_now,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub(crate) struct MemoryState {
    pub materializations: BTreeMap<RunId, BTreeMap<NodeName, Materialization>>,
    pub latest: BTreeMap<NodeName, RunId>,
    pub runs: BTreeMap<RunId, RunRecord>,
    pub last_run_id: Option<RunId>,
}

#[derive(Clone, Debug, Default)]
pub struct MemoryMaterializationStore {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryMaterializationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_state(state: MemoryState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub(crate) fn snapshot(&self) -> StoreResult<MemoryState> {
        Ok(self.lock()?.clone())
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, MemoryState>> {
        self.inner.lock().map_err(|_| {
            StoreError::Backend("memory materialization store mutex poisoned".to_string())
        })
    }
}

#[async_trait::async_trait]
impl MaterializationStore for MemoryMaterializationStore {
    async fn put(
        &self,
        run_id: &str,
        node: &str,
        record: MaterializationRecord,
    ) -> StoreResult<Materialization> {
        if run_id.is_empty() || node.is_empty() {
            return Err(StoreError::InvalidInput(
                "run id and node name must be non-empty".to_string(),
            ));
        }

        let content_hash = record
            .output
            .as_ref()
            .map(content_hash)
            .transpose()
            .map_err(|err| StoreError::Serialization(err.to_string()))?;
        let materialization = Materialization {
            run_id: run_id.to_string(),
            node: node.to_string(),
            status: record.status,
            output: record.output,
            metadata: record.metadata,
            failure: record.failure,
            content_hash,
            recorded_at: timestamp_now(),
        };

        let mut state = self.lock()?;
        if materialization.is_succeeded() {
            state.latest.insert(node.to_string(), run_id.to_string());
        }
        state
            .materializations
            .entry(run_id.to_string())
            .or_default()
            .insert(node.to_string(), materialization.clone());

        Ok(materialization)
    }

    async fn get(&self, run_id: &str, node: &str) -> StoreResult<Materialization> {
        let state = self.lock()?;
        state
            .materializations
            .get(run_id)
            .and_then(|nodes| nodes.get(node))
            .cloned()
            .ok_or_else(|| StoreError::NotMaterialized {
                run_id: run_id.to_string(),
                node: node.to_string(),
            })
    }

    async fn latest(&self, node: &str) -> StoreResult<Option<Materialization>> {
        let state = self.lock()?;
        let Some(run_id) = state.latest.get(node) else {
            return Ok(None);
        };
        Ok(state
            .materializations
            .get(run_id)
            .and_then(|nodes| nodes.get(node))
            .cloned())
    }

    async fn list_run(&self, run_id: &str) -> StoreResult<Vec<Materialization>> {
        let state = self.lock()?;
        Ok(state
            .materializations
            .get(run_id)
            .map(|nodes| nodes.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn save_run(&self, run: RunRecord) -> StoreResult<()> {
        let mut state = self.lock()?;
        state.last_run_id = Some(run.run_id.clone());
        state.runs.insert(run.run_id.clone(), run);
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> StoreResult<Option<RunRecord>> {
        Ok(self.lock()?.runs.get(run_id).cloned())
    }

    async fn latest_run(&self) -> StoreResult<Option<RunRecord>> {
        let state = self.lock()?;
        Ok(state
            .last_run_id
            .as_ref()
            .and_then(|run_id| state.runs.get(run_id))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MetadataMap, MetadataValue, NodeFailure, NodeStatus, OutputRef, RunStatus};
    use serde_json::json;

    fn succeeded(value: serde_json::Value) -> MaterializationRecord {
        MaterializationRecord::succeeded(
            OutputRef::value(value),
            MetadataMap::from([("row_count".to_string(), MetadataValue::Int(2))]),
        )
    }

    #[tokio::test(flavor = "current_thread")]
    async fn get_missing_node_expected_not_materialized() {
        let store = MemoryMaterializationStore::new();
        let error = store
            .get("run-1", "sites_data_csv")
            .await
            .expect_err("missing materialization should fail");

        assert!(matches!(
            error,
            StoreError::NotMaterialized { ref run_id, ref node }
                if run_id == "run-1" && node == "sites_data_csv"
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn put_same_key_twice_expected_second_value_wins() {
        let store = MemoryMaterializationStore::new();
        store
            .put("run-1", "a", succeeded(json!("first")))
            .await
            .expect("first put should succeed");
        store
            .put("run-1", "a", succeeded(json!("second")))
            .await
            .expect("second put should succeed");

        let stored = store.get("run-1", "a").await.expect("get should succeed");
        assert_eq!(stored.output, Some(OutputRef::value(json!("second"))));
        assert_eq!(
            store.list_run("run-1").await.expect("list should succeed").len(),
            1
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn put_across_runs_expected_latest_returns_newest_output() {
        let store = MemoryMaterializationStore::new();
        store
            .put("run-1", "a", succeeded(json!(1)))
            .await
            .expect("put should succeed");
        store
            .put("run-2", "a", succeeded(json!(2)))
            .await
            .expect("put should succeed");

        let latest = store
            .latest("a")
            .await
            .expect("latest should succeed")
            .expect("latest should exist");
        assert_eq!(latest.run_id, "run-2");
        assert_eq!(latest.output, Some(OutputRef::value(json!(2))));

        let first = store.get("run-1", "a").await.expect("old run stays readable");
        assert_eq!(first.output, Some(OutputRef::value(json!(1))));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn put_failure_expected_latest_keeps_previous_success() {
        let store = MemoryMaterializationStore::new();
        store
            .put("run-1", "a", succeeded(json!("ok")))
            .await
            .expect("put should succeed");
        store
            .put(
                "run-2",
                "a",
                MaterializationRecord::failed(NodeFailure::new("node_compute", "boom")),
            )
            .await
            .expect("put should succeed");

        let latest = store
            .latest("a")
            .await
            .expect("latest should succeed")
            .expect("latest should exist");
        assert_eq!(latest.run_id, "run-1");

        let failed = store.get("run-2", "a").await.expect("failure is recorded");
        assert_eq!(failed.status, NodeStatus::Failed);
        assert!(failed.content_hash.is_none());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn save_run_twice_expected_latest_run_tracks_last_save() {
        let store = MemoryMaterializationStore::new();
        for run_id in ["run-1", "run-2"] {
            store
                .save_run(RunRecord {
                    run_id: run_id.to_string(),
                    started_at: timestamp_now(),
                    finished_at: None,
                    status: RunStatus::Running,
                    selection: Vec::new(),
                    nodes: BTreeMap::new(),
                })
                .await
                .expect("save should succeed");
        }

        let latest = store
            .latest_run()
            .await
            .expect("latest run should succeed")
            .expect("latest run should exist");
        assert_eq!(latest.run_id, "run-2");
        assert!(store.get_run("run-1").await.expect("get run").is_some());
    }
}
