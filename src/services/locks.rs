//! Fixed-size table of per-resource locks.
//!
//! Resources hash onto a bounded number of shards, so memory stays constant
//! no matter how many resources are touched. Two resources may share a shard;
//! that only costs some extra serialization.

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
};
use tokio::sync::{Mutex, MutexGuard};

pub const DEFAULT_LOCK_SHARDS: usize = 256;

pub struct ResourceLocks {
    shards: Vec<Mutex<()>>,
}

impl Default for ResourceLocks {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_SHARDS)
    }
}

impl ResourceLocks {
    pub fn new(shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_index(&self, token: &str, filename: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        filename.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    /// Wait for exclusive access to `(token, filename)`.
    pub async fn lock(&self, token: &str, filename: &str) -> MutexGuard<'_, ()> {
        self.shards[self.shard_index(token, filename)].lock().await
    }
}
