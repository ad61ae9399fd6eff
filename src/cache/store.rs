//! Backends for the derivative cache.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use moka::future::Cache;

use crate::error::{PipelineError, PipelineResult};
use crate::storage::LocalFileStorage;

/// Raw key/value store behind [`DerivativeCache`](super::DerivativeCache).
///
/// Implementations report failures honestly; the cache layer decides what to
/// swallow.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> PipelineResult<Option<Bytes>>;
    async fn put(&self, key: &str, blob: Bytes) -> PipelineResult<()>;
    async fn keys(&self) -> PipelineResult<Vec<String>>;
    async fn remove(&self, key: &str) -> PipelineResult<()>;
    async fn clear(&self) -> PipelineResult<()>;
}

/// Derivatives written as files under a cache directory.
#[derive(Clone, Debug)]
pub struct FileCacheStore {
    storage: LocalFileStorage,
}

impl FileCacheStore {
    pub fn new(storage: LocalFileStorage) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl CacheStore for FileCacheStore {
    async fn get(&self, key: &str) -> PipelineResult<Option<Bytes>> {
        match self.storage.get(key).await? {
            // A zero-length file only ever comes from an interrupted write.
            Some(bytes) if bytes.is_empty() => Err(PipelineError::StorageCorruption {
                detail: format!("empty cache entry {key}"),
            }),
            other => Ok(other.map(Bytes::from)),
        }
    }

    async fn put(&self, key: &str, blob: Bytes) -> PipelineResult<()> {
        self.storage.put_atomic(key, &blob).await?;
        Ok(())
    }

    async fn keys(&self) -> PipelineResult<Vec<String>> {
        let objects = self.storage.list("").await?;
        Ok(objects.into_iter().map(|object| object.key).collect())
    }

    async fn remove(&self, key: &str) -> PipelineResult<()> {
        self.storage.delete(key).await?;
        Ok(())
    }

    async fn clear(&self) -> PipelineResult<()> {
        self.storage.delete_prefix("").await?;
        Ok(())
    }
}

/// Capacity-bounded in-memory store. Entries may be evicted at any time, which
/// is exactly the contract registry derivative lists are written against.
#[derive(Clone, Debug)]
pub struct MemoryCacheStore {
    inner: Cache<String, Bytes>,
}

impl MemoryCacheStore {
    pub fn new(max_capacity: u64) -> Self {
        Self {
            inner: Cache::new(max_capacity),
        }
    }

    pub fn with_ttl(max_capacity: u64, ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
        }
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> PipelineResult<Option<Bytes>> {
        Ok(self.inner.get(key).await)
    }

    async fn put(&self, key: &str, blob: Bytes) -> PipelineResult<()> {
        self.inner.insert(key.to_string(), blob).await;
        Ok(())
    }

    async fn keys(&self) -> PipelineResult<Vec<String>> {
        let mut keys: Vec<String> = self.inner.iter().map(|(key, _)| (*key).clone()).collect();
        keys.sort();
        Ok(keys)
    }

    async fn remove(&self, key: &str) -> PipelineResult<()> {
        self.inner.invalidate(key).await;
        Ok(())
    }

    async fn clear(&self) -> PipelineResult<()> {
        self.inner.invalidate_all();
        self.inner.run_pending_tasks().await;
        Ok(())
    }
}
