use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;
use tracing::{error, warn};

use crate::cache::CacheStore;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};

/// Site-namespaced derivative cache.
///
/// Every call is bounded by a timeout and every failure degrades to a miss,
/// an empty listing or a no-op. Nothing above this layer ever sees a cache
/// error; losing the cache only costs regeneration time.
#[derive(Clone)]
pub struct DerivativeCache {
    store: Arc<dyn CacheStore>,
    read_timeout: Duration,
    list_timeout: Duration,
}

impl DerivativeCache {
    pub fn new(store: Arc<dyn CacheStore>, config: &PipelineConfig) -> Self {
        Self {
            store,
            read_timeout: config.cache_read_timeout,
            list_timeout: config.cache_list_timeout,
        }
    }

    pub async fn get(&self, key: &str) -> Option<Bytes> {
        let result = self.guarded("get", self.read_timeout, self.store.get(key)).await;
        match result {
            Ok(found) => found,
            Err(PipelineError::StorageCorruption { detail }) => {
                self.recover_from_corruption(&detail).await;
                None
            }
            Err(err) => {
                warn!(key, error = %err, "derivative cache read failed, treating as miss");
                None
            }
        }
    }

    pub async fn put(&self, key: &str, blob: Bytes) {
        if let Err(err) = self
            .guarded("put", self.read_timeout, self.store.put(key, blob))
            .await
        {
            warn!(key, error = %err, "derivative cache write failed");
        }
    }

    /// Keys under `{site_id}/`. The trailing slash keeps `site` from matching
    /// `site-extended`.
    pub async fn list_keys(&self, site_id: &str) -> Vec<String> {
        let prefix = format!("{site_id}/");
        match self
            .guarded("list_keys", self.list_timeout, self.store.keys())
            .await
        {
            Ok(keys) => keys.into_iter().filter(|key| key.starts_with(&prefix)).collect(),
            Err(err) => {
                warn!(site_id, error = %err, "derivative cache key listing failed");
                Vec::new()
            }
        }
    }

    pub async fn remove(&self, key: &str) {
        let _ = self.try_remove(key).await;
    }

    /// [`remove`](Self::remove) for callers that account for what was deleted.
    /// The failure is still logged here.
    pub async fn try_remove(&self, key: &str) -> PipelineResult<()> {
        let result = self
            .guarded("remove", self.read_timeout, self.store.remove(key))
            .await;
        if let Err(err) = &result {
            warn!(key, error = %err, "derivative cache remove failed");
        }
        result
    }

    /// Removes every key of `site_id`, returning how many were targeted.
    pub async fn clear_for_site(&self, site_id: &str) -> usize {
        let keys = self.list_keys(site_id).await;
        for key in &keys {
            self.remove(key).await;
        }
        keys.len()
    }

    pub async fn clear_all(&self) {
        if let Err(err) = self
            .guarded("clear_all", self.list_timeout, self.store.clear())
            .await
        {
            warn!(error = %err, "derivative cache clear failed");
        }
    }

    async fn recover_from_corruption(&self, detail: &str) {
        error!(detail, "derivative cache corrupted, clearing every entry");
        self.clear_all().await;
    }

    async fn guarded<T>(
        &self,
        operation: &str,
        limit: Duration,
        future: impl Future<Output = PipelineResult<T>>,
    ) -> PipelineResult<T> {
        match timeout(limit, future).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::timeout(format!(
                "derivative cache {operation} exceeded {}ms",
                limit.as_millis()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StalledStore;

    #[async_trait]
    impl CacheStore for StalledStore {
        async fn get(&self, _key: &str) -> PipelineResult<Option<Bytes>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Some(Bytes::from_static(b"late")))
        }
        async fn put(&self, _key: &str, _blob: Bytes) -> PipelineResult<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
        async fn keys(&self) -> PipelineResult<Vec<String>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(vec!["s/a".into()])
        }
        async fn remove(&self, _key: &str) -> PipelineResult<()> {
            Err(PipelineError::Storage("boom".into()))
        }
        async fn clear(&self) -> PipelineResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CorruptStore {
        clears: AtomicUsize,
    }

    #[async_trait]
    impl CacheStore for CorruptStore {
        async fn get(&self, key: &str) -> PipelineResult<Option<Bytes>> {
            Err(PipelineError::StorageCorruption { detail: key.to_string() })
        }
        async fn put(&self, _key: &str, _blob: Bytes) -> PipelineResult<()> {
            Ok(())
        }
        async fn keys(&self) -> PipelineResult<Vec<String>> {
            Ok(Vec::new())
        }
        async fn remove(&self, _key: &str) -> PipelineResult<()> {
            Ok(())
        }
        async fn clear(&self) -> PipelineResult<()> {
            self.clears.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fast_config() -> PipelineConfig {
        PipelineConfig {
            cache_read_timeout: Duration::from_millis(20),
            cache_list_timeout: Duration::from_millis(40),
            ..PipelineConfig::default()
        }
    }

    #[tokio::test]
    async fn list_keys_uses_exact_site_prefix() {
        let store = Arc::new(MemoryCacheStore::default());
        let cache = DerivativeCache::new(store, &PipelineConfig::default());
        cache.put("site/assets/derivatives/a.png", Bytes::from_static(b"a")).await;
        cache.put("site/sub/b.png", Bytes::from_static(b"b")).await;
        cache.put("site-extended/assets/derivatives/c.png", Bytes::from_static(b"c")).await;
        let mut keys = cache.list_keys("site").await;
        keys.sort();
        assert_eq!(keys, vec!["site/assets/derivatives/a.png", "site/sub/b.png"]);
    }

    #[tokio::test]
    async fn stalled_store_degrades_to_safe_fallbacks() {
        let cache = DerivativeCache::new(Arc::new(StalledStore), &fast_config());
        assert_eq!(cache.get("s/a").await, None);
        cache.put("s/a", Bytes::from_static(b"x")).await;
        assert!(cache.list_keys("s").await.is_empty());
        cache.remove("s/a").await;
    }

    #[tokio::test]
    async fn corruption_clears_the_store() {
        let store = Arc::new(CorruptStore::default());
        let cache = DerivativeCache::new(store.clone(), &PipelineConfig::default());
        assert_eq!(cache.get("s/a").await, None);
        assert_eq!(store.clears.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn clear_for_site_leaves_other_sites() {
        let cache = DerivativeCache::new(Arc::new(MemoryCacheStore::default()), &PipelineConfig::default());
        cache.put("a/assets/derivatives/1.png", Bytes::from_static(b"1")).await;
        cache.put("b/assets/derivatives/2.png", Bytes::from_static(b"2")).await;
        assert_eq!(cache.clear_for_site("a").await, 1);
        assert_eq!(cache.get("a/assets/derivatives/1.png").await, None);
        assert!(cache.get("b/assets/derivatives/2.png").await.is_some());
    }
}
