use super::{ObjectStore, SinkError, validate_bucket, validate_key};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

type Objects = BTreeMap<(String, String), Bytes>;

/// In-process object store. Buckets listed in `rejecting` fail every `put`,
/// which lets callers exercise upload failures.
#[derive(Clone, Debug, Default)]
pub struct MemoryObjectStore {
    objects: Arc<RwLock<Objects>>,
    rejecting: Arc<RwLock<BTreeSet<String>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_puts(&self, bucket: impl Into<String>) -> Result<(), SinkError> {
        self.rejecting
            .write()
            .map_err(|_| SinkError::Io("memory object store lock poisoned".to_string()))?
            .insert(bucket.into());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.objects.read().map(|objects| objects.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> SinkError {
        SinkError::Io("memory object store lock poisoned".to_string())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, SinkError> {
        let objects = self.objects.read().map_err(|_| Self::poisoned())?;
        objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| SinkError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), SinkError> {
        validate_bucket(bucket)?;
        validate_key(key)?;
        if self
            .rejecting
            .read()
            .map_err(|_| Self::poisoned())?
            .contains(bucket)
        {
            return Err(SinkError::Rejected {
                bucket: bucket.to_string(),
                key: key.to_string(),
                reason: "bucket is not writable".to_string(),
            });
        }
        self.objects
            .write()
            .map_err(|_| Self::poisoned())?
            .insert((bucket.to_string(), key.to_string()), body);
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, SinkError> {
        let objects = self.objects.read().map_err(|_| Self::poisoned())?;
        Ok(objects
            .keys()
            .filter(|(candidate, key)| candidate == bucket && key.starts_with(prefix))
            .map(|(_, key)| key.clone())
            .collect())
    }

    fn locator(&self, bucket: &str, key: &str) -> String {
        format!("memory://{bucket}/{key}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn put_then_list_expected_sorted_keys_under_prefix() {
        let store = MemoryObjectStore::new();
        for key in ["bronze/b.json", "bronze/a.json", "silver/c.parquet"] {
            store
                .put("lake", key, Bytes::from_static(b"{}"))
                .await
                .expect("put should succeed");
        }

        let keys = store.list("lake", "bronze/").await.expect("list should succeed");
        assert_eq!(keys, vec!["bronze/a.json", "bronze/b.json"]);
        assert!(store.list("other", "").await.expect("list").is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn put_into_rejecting_bucket_expected_rejected_and_nothing_stored() {
        let store = MemoryObjectStore::new();
        store.reject_puts("lake").expect("reject should register");

        let error = store
            .put("lake", "gold/x.parquet", Bytes::from_static(b"PAR1"))
            .await
            .expect_err("put should be rejected");
        assert!(matches!(error, SinkError::Rejected { .. }));
        assert!(store.is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn get_missing_object_expected_not_found() {
        let store = MemoryObjectStore::new();
        let error = store
            .get("lake", "bronze/sites_data.csv")
            .await
            .expect_err("missing object should fail");
        assert!(matches!(error, SinkError::NotFound { .. }));
    }
}
