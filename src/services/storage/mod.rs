//! Content storage backends.
//!
//! Every backend exposes the same [`Storage`] capability set so the transfer
//! service never needs to know where bytes live:
//!
//! - [`local::LocalStorage`]: files on disk, sharded by token
//! - [`operator::OperatorStorage`]: object store (S3) and cloud drive
//!   (Google Drive) through OpenDAL
//! - [`kv::RedisStorage`]: key-value store (Redis)
//! - [`memory::MemoryStorage`]: in-process map
//!
//! Absence is always reported as [`StorageError::NotFound`]; callers test it
//! with [`Storage::is_not_exist`] rather than matching backend errors.

pub mod kv;
pub mod local;
pub mod memory;
pub mod operator;

#[cfg(test)]
pub(crate) mod conformance;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use std::{io, path::PathBuf, sync::Arc};
use thiserror::Error;

/// Streamed object body.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

const MAX_KEY_PART_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("`{token}/{filename}` not found")]
    NotFound { token: String, filename: String },
    #[error("declared length {declared} does not match {actual} bytes received")]
    LengthMismatch { declared: u64, actual: u64 },
    #[error("invalid resource key")]
    InvalidKey,
    #[error("storage misconfigured: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    OpenDal(#[from] opendal::Error),
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    pub fn not_found(token: &str, filename: &str) -> Self {
        Self::NotFound {
            token: token.to_string(),
            filename: filename.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Size and type of a stored object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectInfo {
    pub content_length: u64,
    pub content_type: String,
}

/// An opened object ready to be streamed out.
pub struct StoredObject {
    pub body: ByteStream,
    pub content_length: u64,
    pub content_type: String,
}

impl StoredObject {
    pub fn from_bytes(data: Bytes, content_type: impl Into<String>) -> Self {
        Self {
            content_length: data.len() as u64,
            content_type: content_type.into(),
            body: body_from_bytes(data),
        }
    }

    /// Drain the body into memory.
    pub async fn into_bytes(self) -> io::Result<Bytes> {
        collect_body(self.body).await
    }
}

/// Capability set shared by every content backend.
///
/// Implementations must be safe to call concurrently for unrelated
/// resources without external locking.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Open the object for reading.
    async fn get(&self, token: &str, filename: &str) -> StorageResult<StoredObject>;

    /// Size and type only. Never counts as a download.
    async fn head(&self, token: &str, filename: &str) -> StorageResult<ObjectInfo>;

    /// Create or fully overwrite the object.
    async fn put(
        &self,
        token: &str,
        filename: &str,
        body: ByteStream,
        content_type: &str,
        content_length: u64,
    ) -> StorageResult<()>;

    /// Remove the object. Deleting a missing object is not a failure of the
    /// process; backends return `Ok(())` or `NotFound`.
    async fn delete(&self, token: &str, filename: &str) -> StorageResult<()>;

    /// Short backend name for logs.
    fn kind(&self) -> &'static str;

    fn is_not_exist(&self, err: &StorageError) -> bool {
        err.is_not_found()
    }
}

/// Reject key parts that could escape a backend's namespace.
///
/// Applied to both token and filename by every backend.
pub fn ensure_key_safe(part: &str) -> StorageResult<()> {
    if part.is_empty() || part.len() > MAX_KEY_PART_LEN {
        return Err(StorageError::InvalidKey);
    }
    if part.starts_with('.') || part.contains("..") {
        return Err(StorageError::InvalidKey);
    }
    if part
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'/' || b == b'\\' || b == b':')
    {
        return Err(StorageError::InvalidKey);
    }
    Ok(())
}

pub(crate) fn ensure_resource_key_safe(token: &str, filename: &str) -> StorageResult<()> {
    ensure_key_safe(token)?;
    ensure_key_safe(filename)
}

/// Buffer a body stream completely.
pub async fn collect_body(body: ByteStream) -> io::Result<Bytes> {
    let chunks: Vec<Bytes> = body.try_collect().await?;
    if chunks.len() == 1 {
        return Ok(chunks.into_iter().next().unwrap_or_default());
    }
    let mut buf = Vec::with_capacity(chunks.iter().map(Bytes::len).sum());
    for chunk in chunks {
        buf.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(buf))
}

/// Buffer a body and verify it against the declared length.
pub(crate) async fn collect_declared(body: ByteStream, declared: u64) -> StorageResult<Bytes> {
    let data = collect_body(body).await?;
    let actual = data.len() as u64;
    if actual != declared {
        return Err(StorageError::LengthMismatch { declared, actual });
    }
    Ok(data)
}

/// Wrap an in-memory buffer as a body stream.
pub fn body_from_bytes(data: impl Into<Bytes>) -> ByteStream {
    let data = data.into();
    futures::stream::once(async move { Ok(data) }).boxed()
}

/// Settings for every backend a provider name can select.
#[derive(Clone, Debug, Default)]
pub struct StorageOptions {
    pub basedir: Option<PathBuf>,
    pub s3: operator::S3Options,
    pub gdrive: operator::GdriveOptions,
    pub redis_url: Option<String>,
}

/// Construct the backend named by `provider`.
pub async fn build_storage(provider: &str, opts: &StorageOptions) -> StorageResult<Arc<dyn Storage>> {
    let storage: Arc<dyn Storage> = match provider {
        "local" => {
            let basedir = opts
                .basedir
                .clone()
                .ok_or_else(|| StorageError::Config("basedir not set".into()))?;
            Arc::new(local::LocalStorage::new(basedir).await?)
        }
        "s3" => Arc::new(operator::OperatorStorage::s3(&opts.s3)?),
        "gdrive" => Arc::new(operator::OperatorStorage::gdrive(&opts.gdrive)?),
        "redis" => {
            let url = opts
                .redis_url
                .as_deref()
                .ok_or_else(|| StorageError::Config("redis url not set".into()))?;
            Arc::new(kv::RedisStorage::connect(url).await?)
        }
        "memory" => Arc::new(memory::MemoryStorage::new()),
        other => {
            return Err(StorageError::Config(format!(
                "unknown storage provider `{other}`"
            )));
        }
    };

    tracing::info!(provider = storage.kind(), "storage backend ready");
    Ok(storage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsafe_key_parts_are_rejected() {
        for bad in ["", ".", "..", "../x", "a/b", "a\\b", ".hidden", "a:b", "a\nb"] {
            assert!(ensure_key_safe(bad).is_err(), "{bad:?} should be rejected");
        }
        for good in ["abc123", "report.pdf", "a b.txt", "v1.2.tar.gz"] {
            assert!(ensure_key_safe(good).is_ok(), "{good:?} should be accepted");
        }
    }

    #[tokio::test]
    async fn declared_length_is_enforced() {
        let err = collect_declared(body_from_bytes("hello"), 4).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::LengthMismatch {
                declared: 4,
                actual: 5
            }
        ));
        let data = collect_declared(body_from_bytes("hello"), 5).await.unwrap();
        assert_eq!(&data[..], b"hello");
    }

    #[tokio::test]
    async fn unknown_provider_is_a_config_error() {
        let err = build_storage("floppy", &StorageOptions::default()).await.err().unwrap();
        assert!(matches!(err, StorageError::Config(_)));
    }

    #[tokio::test]
    async fn local_provider_requires_basedir() {
        let err = build_storage("local", &StorageOptions::default()).await.err().unwrap();
        assert!(matches!(err, StorageError::Config(_)));
    }
}
