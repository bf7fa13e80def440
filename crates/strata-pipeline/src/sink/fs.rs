use super::{ObjectStore, SinkError, validate_bucket, validate_key};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::Write;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// File name prefix of in-flight uploads. Keys may not use it, and listings
/// never return it.
const UPLOAD_PREFIX: &str = ".strata-upload-";

/// Object store over a local directory: `<root>/<bucket>/<key>`.
#[derive(Clone, Debug)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, SinkError> {
        validate_bucket(bucket)?;
        validate_key(key)?;
        if key.split('/').any(|segment| segment.starts_with(UPLOAD_PREFIX)) {
            return Err(SinkError::InvalidKey(key.to_string()));
        }
        Ok(key
            .split('/')
            .fold(self.root.join(bucket), |path, segment| path.join(segment)))
    }
}

fn io_error(action: &str, path: &Path, error: std::io::Error) -> SinkError {
    SinkError::Io(format!("{action} '{}' failed: {error}", path.display()))
}

/// Writes `body` to a uniquely named file in `path`'s directory, then renames
/// it onto `path`. A failed upload leaves nothing behind.
fn write_object(path: &Path, body: &[u8]) -> Result<(), SinkError> {
    let parent = path.parent().unwrap_or(Path::new("."));
    let mut upload = tempfile::Builder::new()
        .prefix(UPLOAD_PREFIX)
        .tempfile_in(parent)
        .map_err(|error| io_error("create upload in", parent, error))?;
    upload
        .write_all(body)
        .and_then(|()| upload.as_file().sync_all())
        .map_err(|error| io_error("write", upload.path(), error))?;
    upload
        .persist(path)
        .map_err(|error| io_error("rename upload onto", path, error.error))?;
    Ok(())
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, SinkError> {
        let path = self.object_path(bucket, key)?;
        match tokio::fs::read(&path).await {
            Ok(raw) => Ok(Bytes::from(raw)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Err(SinkError::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                })
            }
            Err(error) => Err(io_error("read", &path, error)),
        }
    }

    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), SinkError> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|error| io_error("create directory", parent, error))?;
        }

        let len = body.len();
        tokio::task::spawn_blocking(move || write_object(&path, &body))
            .await
            .map_err(|error| SinkError::Io(format!("object writer panicked: {error}")))??;

        tracing::debug!(bucket, key, bytes = len, "stored object");
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, SinkError> {
        validate_bucket(bucket)?;
        let bucket_root = self.root.join(bucket);
        if !bucket_root.is_dir() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        for entry in WalkDir::new(&bucket_root) {
            let entry = entry.map_err(|error| SinkError::Io(error.to_string()))?;
            if !entry.file_type().is_file()
                || entry.file_name().to_string_lossy().starts_with(UPLOAD_PREFIX)
            {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&bucket_root) else {
                continue;
            };
            let key = relative
                .components()
                .map(|component| component.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn locator(&self, bucket: &str, key: &str) -> String {
        format!("file://{}/{bucket}/{key}", self.root.display())
    }
}
