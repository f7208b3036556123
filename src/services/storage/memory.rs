//! In-process backend. Contents vanish with the process.

use super::{
    ByteStream, ObjectInfo, Storage, StorageError, StorageResult, StoredObject, collect_declared,
    ensure_resource_key_safe,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Clone)]
struct MemoryObject {
    data: Bytes,
    content_type: String,
}

#[derive(Default)]
pub struct MemoryStorage {
    objects: RwLock<HashMap<(String, String), MemoryObject>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    fn key(token: &str, filename: &str) -> (String, String) {
        (token.to_string(), filename.to_string())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, token: &str, filename: &str) -> StorageResult<StoredObject> {
        ensure_resource_key_safe(token, filename)?;
        let object = self
            .objects
            .read()
            .get(&Self::key(token, filename))
            .cloned()
            .ok_or_else(|| StorageError::not_found(token, filename))?;
        Ok(StoredObject::from_bytes(object.data, object.content_type))
    }

    async fn head(&self, token: &str, filename: &str) -> StorageResult<ObjectInfo> {
        ensure_resource_key_safe(token, filename)?;
        self.objects
            .read()
            .get(&Self::key(token, filename))
            .map(|object| ObjectInfo {
                content_length: object.data.len() as u64,
                content_type: object.content_type.clone(),
            })
            .ok_or_else(|| StorageError::not_found(token, filename))
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
        let data = collect_declared(body, content_length).await?;
        self.objects.write().insert(
            Self::key(token, filename),
            MemoryObject {
                data,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn delete(&self, token: &str, filename: &str) -> StorageResult<()> {
        ensure_resource_key_safe(token, filename)?;
        self.objects
            .write()
            .remove(&Self::key(token, filename))
            .map(|_| ())
            .ok_or_else(|| StorageError::not_found(token, filename))
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}
