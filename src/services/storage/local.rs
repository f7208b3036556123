//! Filesystem backend.
//!
//! Content lives beneath `base_path/{shard}/{shard}/{token}/{filename}` where
//! the shards are the first two bytes of `md5(token)`. The content type is kept
//! in a sidecar `.{filename}.type` next to the content. Sanitized filenames
//! never begin with a dot, so sidecars cannot collide with uploads.
//!
//! Write ordering: content is streamed to a temp file, fsynced and renamed
//! into place before the sidecar is written. A reader that races a first
//! write may see content without a sidecar and falls back to
//! `application/octet-stream`.

use super::{
    ByteStream, DEFAULT_CONTENT_TYPE, ObjectInfo, Storage, StorageError, StorageResult,
    StoredObject, ensure_resource_key_safe,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct LocalStorage {
    /// Base directory on disk where payloads are stored.
    base_path: PathBuf,
}

impl LocalStorage {
    /// Create the base directory if needed.
    pub async fn new(base_path: impl Into<PathBuf>) -> StorageResult<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).await?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Two-level shard identifiers for a token, `00`–`ff` each.
    fn token_shards(token: &str) -> (String, String) {
        let digest = md5::compute(token);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn token_dir(&self, token: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::token_shards(token);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(token);
        path
    }

    fn content_path(&self, token: &str, filename: &str) -> PathBuf {
        self.token_dir(token).join(filename)
    }

    fn type_path(&self, token: &str, filename: &str) -> PathBuf {
        self.token_dir(token).join(format!(".{filename}.type"))
    }

    async fn read_content_type(&self, token: &str, filename: &str) -> StorageResult<String> {
        match fs::read_to_string(self.type_path(token, filename)).await {
            Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
            Ok(_) => Ok(DEFAULT_CONTENT_TYPE.to_string()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(DEFAULT_CONTENT_TYPE.to_string()),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    fn map_not_found(err: io::Error, token: &str, filename: &str) -> StorageError {
        if err.kind() == ErrorKind::NotFound {
            StorageError::not_found(token, filename)
        } else {
            StorageError::Io(err)
        }
    }

    /// Stream the body into a temp file and rename it over `target`.
    ///
    /// The rename only happens once the byte count matches `expected`, so a
    /// short or long upload never replaces existing content. The temp file is
    /// removed on any failure.
    async fn write_atomically(
        &self,
        target: &Path,
        body: ByteStream,
        expected: u64,
    ) -> StorageResult<u64> {
        let parent = target.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "content path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let written = match Self::stream_to_file(&tmp_path, body).await {
            Ok(written) => written,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        };

        if written != expected {
            let _ = fs::remove_file(&tmp_path).await;
            self.prune_empty_dirs(&parent, &self.base_path).await;
            return Err(StorageError::LengthMismatch {
                declared: expected,
                actual: written,
            });
        }

        if let Err(err) = fs::rename(&tmp_path, target).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        Ok(written)
    }

    async fn stream_to_file(path: &Path, mut body: ByteStream) -> io::Result<u64> {
        let mut file = File::create(path).await?;
        let mut written: u64 = 0;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }

    /// Remove empty directories from `start` up to, not including, `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn get(&self, token: &str, filename: &str) -> StorageResult<StoredObject> {
        ensure_resource_key_safe(token, filename)?;
        let path = self.content_path(token, filename);
        let file = File::open(&path)
            .await
            .map_err(|err| Self::map_not_found(err, token, filename))?;
        let content_length = file.metadata().await?.len();
        let content_type = self.read_content_type(token, filename).await?;

        Ok(StoredObject {
            body: ReaderStream::new(file).boxed(),
            content_length,
            content_type,
        })
    }

    async fn head(&self, token: &str, filename: &str) -> StorageResult<ObjectInfo> {
        ensure_resource_key_safe(token, filename)?;
        let meta = fs::metadata(self.content_path(token, filename))
            .await
            .map_err(|err| Self::map_not_found(err, token, filename))?;
        if !meta.is_file() {
            return Err(StorageError::not_found(token, filename));
        }
        Ok(ObjectInfo {
            content_length: meta.len(),
            content_type: self.read_content_type(token, filename).await?,
        })
    }

    async fn put(
        &self,
        token: &str,
        filename: &str,
        body: ByteStream,
        content_type: &str,
        content_length: u64,
    ) -> StorageResult<()> {
        ensure_resource_key_safe(token, filename)?;
        let path = self.content_path(token, filename);
        let written = self.write_atomically(&path, body, content_length).await?;
        fs::write(self.type_path(token, filename), content_type).await?;
        debug!(token, filename, bytes = written, "stored content on disk");
        Ok(())
    }

    async fn delete(&self, token: &str, filename: &str) -> StorageResult<()> {
        ensure_resource_key_safe(token, filename)?;
        let path = self.content_path(token, filename);

        let removed = match fs::remove_file(&path).await {
            Ok(_) => true,
            Err(err) if err.kind() == ErrorKind::NotFound => false,
            Err(err) => return Err(StorageError::Io(err)),
        };
        match fs::remove_file(self.type_path(token, filename)).await {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(StorageError::Io(err)),
        }

        if let Some(parent) = path.parent() {
            self.prune_empty_dirs(parent, &self.base_path).await;
        }

        if removed {
            debug!("removed {}", path.display());
            Ok(())
        } else {
            Err(StorageError::not_found(token, filename))
        }
    }

    fn kind(&self) -> &'static str {
        "local"
    }
}
