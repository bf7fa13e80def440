use crate::memory::{MemoryMaterializationStore, MemoryState};
use crate::store::{MaterializationStore, StoreError, StoreResult};
use crate::types::{Materialization, MaterializationRecord, RunRecord};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

const STATE_FILE_NAME: &str = "materializations.json";

/// File-backed store. The whole state is rewritten through a temporary file
/// and renamed into place after every mutation.
///
/// Mutations are serialized: the in-memory change and the file write happen
/// under one lock, so the file on disk always matches the latest mutation.
#[derive(Clone, Debug)]
pub struct FsMaterializationStore {
    root: PathBuf,
    state_file: PathBuf,
    inner: MemoryMaterializationStore,
    write_lock: Arc<Mutex<()>>,
}

impl FsMaterializationStore {
    pub fn new<P: AsRef<Path>>(root: P) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|err| {
            StoreError::Backend(format!("create store root failed: {err}"))
        })?;
        let state_file = root.join(STATE_FILE_NAME);
        let state = if state_file.exists() {
            let raw = fs::read(&state_file)
                .map_err(|err| StoreError::Backend(format!("read state file failed: {err}")))?;
            serde_json::from_slice::<MemoryState>(&raw)
                .map_err(|err| StoreError::Serialization(err.to_string()))?
        } else {
            MemoryState::default()
        };

        Ok(Self {
            root,
            state_file,
            inner: MemoryMaterializationStore::from_state(state),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    /// Must be called with `write_lock` held.
    async fn persist(&self) -> StoreResult<()> {
        let snapshot = self.inner.snapshot()?;
        let raw = serde_json::to_vec_pretty(&snapshot)
            .map_err(|err| StoreError::Serialization(err.to_string()))?;
        let root = self.root.clone();
        let state_file = self.state_file.clone();
        tokio::task::spawn_blocking(move || replace_file(&root, &state_file, &raw))
            .await
            .map_err(|err| StoreError::Backend(format!("state file writer panicked: {err}")))??;
        tracing::trace!(path = %self.state_file.display(), "persisted materialization state");
        Ok(())
    }
}

/// Writes `raw` to a uniquely named file beside `target` and renames it over
/// `target`. The temporary file is removed if any step fails.
fn replace_file(dir: &Path, target: &Path, raw: &[u8]) -> StoreResult<()> {
    let mut tmp = tempfile::Builder::new()
        .prefix(".materializations")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|err| StoreError::Backend(format!("create temporary state file failed: {err}")))?;
    tmp.write_all(raw)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|err| StoreError::Backend(format!("write state file failed: {err}")))?;
    tmp.persist(target)
        .map_err(|err| StoreError::Backend(format!("rename state file failed: {}", err.error)))?;
    Ok(())
}

#[async_trait::async_trait]
impl MaterializationStore for FsMaterializationStore {
    async fn put(
        &self,
        run_id: &str,
        node: &str,
        record: MaterializationRecord,
    ) -> StoreResult<Materialization> {
        let _guard = self.write_lock.lock().await;
        let materialization = self.inner.put(run_id, node, record).await?;
        self.persist().await?;
        Ok(materialization)
    }

    async fn get(&self, run_id: &str, node: &str) -> StoreResult<Materialization> {
        self.inner.get(run_id, node).await
    }

    async fn latest(&self, node: &str) -> StoreResult<Option<Materialization>> {
        self.inner.latest(node).await
    }

    async fn list_run(&self, run_id: &str) -> StoreResult<Vec<Materialization>> {
        self.inner.list_run(run_id).await
    }

    async fn save_run(&self, run: RunRecord) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        self.inner.save_run(run).await?;
        self.persist().await
    }

    async fn get_run(&self, run_id: &str) -> StoreResult<Option<RunRecord>> {
        self.inner.get_run(run_id).await
    }

    async fn latest_run(&self) -> StoreResult<Option<RunRecord>> {
        self.inner.latest_run().await
    }
}
