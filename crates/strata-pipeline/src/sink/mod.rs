//! Object storage collaborators. Keys are `/`-separated paths inside a
//! bucket; the concrete backend decides what a bucket is.

mod fs;
mod memory;

pub use fs::FsObjectStore;
pub use memory::MemoryObjectStore;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("object '{key}' not found in bucket '{bucket}'")]
    NotFound { bucket: String, key: String },

    #[error("object store rejected '{key}' in bucket '{bucket}': {reason}")]
    Rejected {
        bucket: String,
        key: String,
        reason: String,
    },

    #[error("invalid object key '{0}'")]
    InvalidKey(String),

    #[error("object store io failure: {0}")]
    Io(String),
}

pub type SharedObjectStore = Arc<dyn ObjectStore>;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, SinkError>;

    /// Stores the complete object. Readers never observe a partial write.
    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), SinkError>;

    /// Keys under `prefix`, sorted.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, SinkError>;

    /// Stable locator recorded as a node's output reference.
    fn locator(&self, bucket: &str, key: &str) -> String;
}

pub(crate) fn validate_key(key: &str) -> Result<(), SinkError> {
    let invalid = key.is_empty()
        || key.starts_with('/')
        || key.ends_with('/')
        || key.contains('\\')
        || key
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if invalid {
        return Err(SinkError::InvalidKey(key.to_string()));
    }
    Ok(())
}

pub(crate) fn validate_bucket(bucket: &str) -> Result<(), SinkError> {
    if bucket.is_empty()
        || bucket
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.'))
        || bucket == "."
        || bucket == ".."
    {
        return Err(SinkError::InvalidKey(format!("bucket '{bucket}'")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_key_traversal_and_empty_segments_expected_rejected() {
        for key in ["", "/abs", "gold/", "a//b", "../escape", "a/./b", "a\\b"] {
            assert!(validate_key(key).is_err(), "{key} should be rejected");
        }
        validate_key("gold/site_business_insights.parquet").expect("nested key is valid");
    }

    #[test]
    fn validate_bucket_expected_simple_names_only() {
        validate_bucket("sites-lake").expect("bucket should be valid");
        assert!(validate_bucket("a/b").is_err());
        assert!(validate_bucket("..").is_err());
    }
}
