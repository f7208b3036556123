//! Metadata repositories.
//!
//! Policy records are kept apart from content behind [`MetadataRepository`],
//! even when both end up in the same physical backend.

pub mod sqlite;

use crate::{
    models::{metadata::Metadata, resource::METADATA_SUFFIX},
    services::storage::{Storage, StorageError, StorageResult, body_from_bytes, collect_body},
};
use async_trait::async_trait;
use std::sync::Arc;

pub use sqlite::SqliteMetadataRepository;

/// Structured access to per-resource policy records.
#[async_trait]
pub trait MetadataRepository: Send + Sync {
    /// Load the record. Absence is `StorageError::NotFound`.
    async fn get(&self, token: &str, filename: &str) -> StorageResult<Metadata>;

    /// Create or replace the record.
    async fn put(&self, token: &str, filename: &str, metadata: &Metadata) -> StorageResult<()>;

    async fn delete(&self, token: &str, filename: &str) -> StorageResult<()>;

    fn kind(&self) -> &'static str;
}

/// Stores each record as JSON at `{token}/{filename}.metadata` in any
/// content backend.
pub struct StorageMetadataRepository {
    storage: Arc<dyn Storage>,
}

impl StorageMetadataRepository {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    fn record_name(filename: &str) -> String {
        format!("{filename}{METADATA_SUFFIX}")
    }

    /// Report absence against the resource, not the record key.
    fn rename_not_found(&self, err: StorageError, token: &str, filename: &str) -> StorageError {
        if self.storage.is_not_exist(&err) {
            StorageError::not_found(token, filename)
        } else {
            err
        }
    }
}

#[async_trait]
impl MetadataRepository for StorageMetadataRepository {
    async fn get(&self, token: &str, filename: &str) -> StorageResult<Metadata> {
        let object = self
            .storage
            .get(token, &Self::record_name(filename))
            .await
            .map_err(|err| self.rename_not_found(err, token, filename))?;
        let data = collect_body(object.body).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    async fn put(&self, token: &str, filename: &str, metadata: &Metadata) -> StorageResult<()> {
        let data = serde_json::to_vec(metadata)?;
        let length = data.len() as u64;
        self.storage
            .put(
                token,
                &Self::record_name(filename),
                body_from_bytes(data),
                "application/json",
                length,
            )
            .await
    }

    async fn delete(&self, token: &str, filename: &str) -> StorageResult<()> {
        self.storage
            .delete(token, &Self::record_name(filename))
            .await
            .map_err(|err| self.rename_not_found(err, token, filename))
    }

    fn kind(&self) -> &'static str {
        self.storage.kind()
    }
}
