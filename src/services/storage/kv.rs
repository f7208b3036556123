//! Key-value backend on Redis.
//!
//! Layout per resource:
//!
//! - `storage:{token}:{filename}`: content bytes
//! - `storage:{token}:{filename}:type`: content type
//! - `storage:{token}:{filename}:length`: content length
//!
//! All three keys are written and read inside one `MULTI`/`EXEC`
//! transaction, so a concurrent `head` or `get` never sees a partial write.

use super::{
    ByteStream, DEFAULT_CONTENT_TYPE, ObjectInfo, Storage, StorageResult, StoredObject,
    StorageError, collect_declared, ensure_resource_key_safe,
};
use async_trait::async_trait;
use bytes::Bytes;
use redis::{Client, aio::ConnectionManager};
use tracing::debug;

const TYPE_SUFFIX: &str = "type";
const LENGTH_SUFFIX: &str = "length";

#[derive(Clone)]
pub struct RedisStorage {
    conn: ConnectionManager,
}

impl RedisStorage {
    /// Connect using a `redis://[:password@]host:port[/db]` URL.
    pub async fn connect(url: &str) -> StorageResult<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    fn keys(token: &str, filename: &str) -> (String, String, String) {
        let key = format!("storage:{token}:{filename}");
        let type_key = format!("{key}:{TYPE_SUFFIX}");
        let length_key = format!("{key}:{LENGTH_SUFFIX}");
        (key, type_key, length_key)
    }
}

#[async_trait]
impl Storage for RedisStorage {
    async fn get(&self, token: &str, filename: &str) -> StorageResult<StoredObject> {
        ensure_resource_key_safe(token, filename)?;
        let (key, type_key, length_key) = Self::keys(token, filename);
        let mut conn = self.conn.clone();

        let (data, content_type, length): (Option<Vec<u8>>, Option<String>, Option<u64>) =
            redis::pipe()
                .atomic()
                .get(&key)
                .get(&type_key)
                .get(&length_key)
                .query_async(&mut conn)
                .await?;

        let data = data.ok_or_else(|| StorageError::not_found(token, filename))?;
        let mut object = StoredObject::from_bytes(
            Bytes::from(data),
            content_type.unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
        );
        if let Some(length) = length {
            object.content_length = length;
        }
        Ok(object)
    }

    async fn head(&self, token: &str, filename: &str) -> StorageResult<ObjectInfo> {
        ensure_resource_key_safe(token, filename)?;
        let (_, type_key, length_key) = Self::keys(token, filename);
        let mut conn = self.conn.clone();

        let (content_type, length): (Option<String>, Option<u64>) = redis::pipe()
            .atomic()
            .get(&type_key)
            .get(&length_key)
            .query_async(&mut conn)
            .await?;

        let content_length = length.ok_or_else(|| StorageError::not_found(token, filename))?;
        Ok(ObjectInfo {
            content_length,
            content_type: content_type.unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
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
        let data = collect_declared(body, content_length).await?;
        let (key, type_key, length_key) = Self::keys(token, filename);
        let mut conn = self.conn.clone();

        let _: () = redis::pipe()
            .atomic()
            .set(&key, data.to_vec())
            .ignore()
            .set(&type_key, content_type)
            .ignore()
            .set(&length_key, content_length)
            .ignore()
            .query_async(&mut conn)
            .await?;

        debug!(token, filename, bytes = content_length, "stored object in redis");
        Ok(())
    }

    async fn delete(&self, token: &str, filename: &str) -> StorageResult<()> {
        ensure_resource_key_safe(token, filename)?;
        let (key, type_key, length_key) = Self::keys(token, filename);
        let mut conn = self.conn.clone();

        let removed: i64 = redis::cmd("DEL")
            .arg(&key)
            .arg(&type_key)
            .arg(&length_key)
            .query_async(&mut conn)
            .await?;

        if removed == 0 {
            return Err(StorageError::not_found(token, filename));
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "redis"
    }
}
