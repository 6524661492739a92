use std::path::{Path, PathBuf};

use anyhow::anyhow;
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use tokio::io::AsyncWriteExt;

/// Errors surfaced by durable storage
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The key does not exist in the store; not a failure of the store
    #[error("not found in permanent storage")]
    NotFound,
    #[error("permanent storage error: {0}")]
    Unavailable(#[from] anyhow::Error),
}

/// Durable write-back target for the ciphertext cache.
///
/// Keys carry the zone prefix (`<zone>/<fileID>`) so multiple caches can
/// share one bucket.
#[async_trait]
pub trait PermanentStorage: Send + Sync {
    /// Human-readable name for logs
    fn name(&self) -> String;

    async fn upload(&self, key: &str, path: &Path) -> Result<(), StorageError>;

    /// Download the whole blob to a local path, returning its length
    async fn download(&self, key: &str, dest: &Path) -> Result<u64, StorageError>;

    /// Fetch `[start, end]` (inclusive, or to EOF when `end` is `None`)
    async fn download_range(
        &self,
        key: &str,
        start: u64,
        end: Option<u64>,
    ) -> Result<Vec<u8>, StorageError>;
}

/// S3-backed durable storage
pub struct S3Storage {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Storage {
    pub async fn connect(bucket: impl Into<String>) -> Self {
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;
        S3Storage {
            client: aws_sdk_s3::Client::new(&config),
            bucket: bucket.into(),
        }
    }

    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        S3Storage {
            client,
            bucket: bucket.into(),
        }
    }
}

fn range_header(start: u64, end: Option<u64>) -> String {
    match end {
        Some(end) => format!("bytes={}-{}", start, end),
        None => format!("bytes={}-", start),
    }
}

#[async_trait]
impl PermanentStorage for S3Storage {
    fn name(&self) -> String {
        format!("s3://{}", self.bucket)
    }

    async fn upload(&self, key: &str, path: &Path) -> Result<(), StorageError> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| anyhow!("unable to open upload source: {}", e))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| anyhow!("s3 put failed: {}", e))?;
        Ok(())
    }

    async fn download(&self, key: &str, dest: &Path) -> Result<u64, StorageError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| match e.as_service_error() {
                Some(svc) if svc.is_no_such_key() => StorageError::NotFound,
                _ => StorageError::Unavailable(anyhow!("s3 get failed: {}", e)),
            })?;
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| anyhow!("unable to create download target: {}", e))?;
        let mut body = output.body;
        let mut written = 0u64;
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| anyhow!("s3 stream failed: {}", e))?
        {
            written += chunk.len() as u64;
            file.write_all(&chunk)
                .await
                .map_err(|e| anyhow!("unable to write download target: {}", e))?;
        }
        file.flush()
            .await
            .map_err(|e| anyhow!("unable to flush download target: {}", e))?;
        Ok(written)
    }

    async fn download_range(
        &self,
        key: &str,
        start: u64,
        end: Option<u64>,
    ) -> Result<Vec<u8>, StorageError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .range(range_header(start, end))
            .send()
            .await
            .map_err(|e| match e.as_service_error() {
                Some(svc) if svc.is_no_such_key() => StorageError::NotFound,
                _ => StorageError::Unavailable(anyhow!("s3 range get failed: {}", e)),
            })?;
        let collected = output
            .body
            .collect()
            .await
            .map_err(|e| anyhow!("s3 stream failed: {}", e))?;
        Ok(collected.into_bytes().to_vec())
    }
}

/// Filesystem-backed durable storage, used by tests and single-node
/// deployments that want durability on another volume.
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileStorage { root: root.into() }
    }

    fn resolve(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl PermanentStorage for FileStorage {
    fn name(&self) -> String {
        format!("file://{}", self.root.display())
    }

    async fn upload(&self, key: &str, path: &Path) -> Result<(), StorageError> {
        let dest = self.resolve(key);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| anyhow!("unable to create storage dir: {}", e))?;
        }
        tokio::fs::copy(path, &dest)
            .await
            .map_err(|e| anyhow!("unable to copy into storage: {}", e))?;
        Ok(())
    }

    async fn download(&self, key: &str, dest: &Path) -> Result<u64, StorageError> {
        let source = self.resolve(key);
        match tokio::fs::copy(&source, dest).await {
            Ok(len) => Ok(len),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound),
            Err(e) => Err(StorageError::Unavailable(anyhow!(
                "unable to copy out of storage: {}",
                e
            ))),
        }
    }

    async fn download_range(
        &self,
        key: &str,
        start: u64,
        end: Option<u64>,
    ) -> Result<Vec<u8>, StorageError> {
        let source = self.resolve(key);
        let data = match tokio::fs::read(&source).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound)
            }
            Err(e) => {
                return Err(StorageError::Unavailable(anyhow!(
                    "unable to read storage: {}",
                    e
                )))
            }
        };
        let start = (start as usize).min(data.len());
        let stop = match end {
            Some(end) => ((end + 1) as usize).min(data.len()),
            None => data.len(),
        };
        Ok(data[start..stop].to_vec())
    }
}
