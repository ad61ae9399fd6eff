//! On-demand derivative generation.
//!
//! Per key: `Uncached -> InFlight -> Cached | Failed`. Failures are not
//! remembered; the next request for the same key starts a new generation.

use std::sync::Arc;

use bytes::Bytes;
use moka::future::Cache;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::cache::{DerivativeCache, DerivativeKey, ParsedDerivative, TransformOptions, parse_derivative_key};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::image_processing::{CompressOptions, ImageResizer, ResizeOptions};
use crate::registry::ImageRegistry;
use crate::singleflight::Singleflight;
use crate::storage::BlobStore;

type SourceKey = (String, String);

#[derive(Clone)]
pub struct DerivativeProcessor {
    inner: Arc<ProcessorInner>,
}

struct ProcessorInner {
    blobs: Arc<dyn BlobStore>,
    cache: DerivativeCache,
    resizer: Arc<dyn ImageResizer>,
    registry: Option<ImageRegistry>,
    config: PipelineConfig,
    generations: Singleflight<String, PipelineResult<Bytes>>,
    fetches: Singleflight<SourceKey, PipelineResult<Bytes>>,
    sources: Cache<SourceKey, Bytes>,
}

impl DerivativeProcessor {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        cache: DerivativeCache,
        resizer: Arc<dyn ImageResizer>,
        config: PipelineConfig,
    ) -> Self {
        let sources = Cache::new(config.source_cache_capacity);
        Self {
            inner: Arc::new(ProcessorInner {
                blobs,
                cache,
                resizer,
                registry: None,
                config,
                generations: Singleflight::new(),
                fetches: Singleflight::new(),
                sources,
            }),
        }
    }

    /// Record every generated derivative against its original in `registry`.
    pub fn with_registry(self, registry: ImageRegistry) -> Self {
        let inner = match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.registry = Some(registry);
                inner
            }
            Err(shared) => ProcessorInner {
                blobs: shared.blobs.clone(),
                cache: shared.cache.clone(),
                resizer: shared.resizer.clone(),
                registry: Some(registry),
                config: shared.config.clone(),
                generations: shared.generations.clone(),
                fetches: shared.fetches.clone(),
                sources: shared.sources.clone(),
            },
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn cache(&self) -> &DerivativeCache {
        &self.inner.cache
    }

    pub async fn get_display_blob(
        &self,
        site_id: &str,
        source_path: &str,
        options: &TransformOptions,
    ) -> PipelineResult<Bytes> {
        let key = DerivativeKey::new(site_id, source_path, options).to_string();
        if let Some(blob) = self.inner.cache.get(&key).await {
            debug!(%key, "derivative cache hit");
            return Ok(blob);
        }

        let inner = Arc::clone(&self.inner);
        let site_id = site_id.to_string();
        let source_path = source_path.to_string();
        let options = *options;
        let flight_key = key.clone();
        let flight = self
            .inner
            .generations
            .run(flight_key, move || async move {
                inner.generate(&site_id, &source_path, &options, &key).await
            })
            .await;
        flight.value.unwrap_or(Err(PipelineError::Interrupted))
    }

    /// Drops the memoized source and every cached derivative rendered from it.
    /// Call after an original is replaced or deleted.
    pub async fn invalidate_source(&self, site_id: &str, source_path: &str) -> usize {
        self.inner
            .sources
            .invalidate(&(site_id.to_string(), source_path.to_string()))
            .await;
        let mut removed = 0;
        for key in self.inner.cache.list_keys(site_id).await {
            if let ParsedDerivative::Current(parsed) = parse_derivative_key(&key) {
                if parsed.matches_source(source_path) {
                    self.inner.cache.remove(&key).await;
                    removed += 1;
                    if let Some(registry) = &self.inner.registry {
                        if let Err(err) = registry.remove_derivative(site_id, source_path, &key).await {
                            warn!(site_id, %key, error = %err, "could not unlink derivative");
                        }
                    }
                }
            }
        }
        removed
    }

    /// Forgets memoized sources and pending handles.
    pub fn clear_memory(&self) {
        self.inner.sources.invalidate_all();
        self.inner.generations.clear();
        self.inner.fetches.clear();
    }

    pub fn in_flight(&self) -> usize {
        self.inner.generations.in_flight()
    }
}

impl ProcessorInner {
    async fn generate(
        self: &Arc<Self>,
        site_id: &str,
        source_path: &str,
        options: &TransformOptions,
        key: &str,
    ) -> PipelineResult<Bytes> {
        // A caller whose first lookup missed may only get here after an earlier
        // flight for this key already stored its result.
        if let Some(blob) = self.cache.get(key).await {
            debug!(key, "derivative stored by an earlier flight");
            return Ok(blob);
        }
        let source = self.fetch_source(site_id, source_path).await?;
        let (source_w, source_h) = self.resizer.dimensions(&source).await?;
        let resize = ResizeOptions {
            max_width: options.width.map(|w| w.min(source_w)),
            max_height: options.height.map(|h| h.min(source_h)),
            crop: options.crop,
            gravity: options.gravity,
        };

        let limit = self.config.resize_timeout;
        let mut blob = timeout(limit, self.resizer.resize(source, resize))
            .await
            .map_err(|_| PipelineError::compression_timeout(limit))??;

        if blob.len() > self.config.compress_threshold_bytes {
            let compress = CompressOptions {
                max_size_mb: self.config.compress_threshold_bytes as f64 / (1024.0 * 1024.0),
                quality: self.config.compress_quality,
            };
            let before = blob.len();
            blob = timeout(limit, self.resizer.compress(blob, compress))
                .await
                .map_err(|_| PipelineError::compression_timeout(limit))??;
            debug!(key, before, after = blob.len(), "compressed oversized derivative");
        }

        self.cache.put(key, blob.clone()).await;
        if let Some(registry) = &self.registry {
            if let Err(err) = registry.add_derivative(site_id, source_path, key).await {
                warn!(site_id, source_path, error = %err, "could not link derivative in registry");
            }
        }
        info!(key, bytes = blob.len(), "generated derivative");
        Ok(blob)
    }

    async fn fetch_source(self: &Arc<Self>, site_id: &str, source_path: &str) -> PipelineResult<Bytes> {
        let source_key = (site_id.to_string(), source_path.to_string());
        if let Some(blob) = self.sources.get(&source_key).await {
            return Ok(blob);
        }
        let inner = Arc::clone(self);
        let key = source_key.clone();
        let flight = self
            .fetches
            .run(source_key, move || async move {
                let blob = inner
                    .blobs
                    .get_asset(&key.0, &key.1)
                    .await?
                    .ok_or_else(|| PipelineError::source_not_found(&key.1))?;
                inner.sources.insert(key, blob.clone()).await;
                Ok(blob)
            })
            .await;
        flight.value.unwrap_or(Err(PipelineError::Interrupted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheStore, CropMode, MemoryCacheStore};
    use crate::image_processing::{RasterResizer, get_dimensions};
    use crate::image_processing::tests::png;
    use crate::registry::{ImageMetadata, MemoryRegistryStore};
    use crate::storage::MemoryBlobStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Resizer that ignores pixels: fixed-size output, optional delay, and an
    /// optional failure on its first call.
    #[derive(Default)]
    struct ScriptedResizer {
        resizes: AtomicUsize,
        compresses: AtomicUsize,
        output_len: usize,
        delay: Duration,
        fail_first: bool,
    }

    #[async_trait]
    impl ImageResizer for ScriptedResizer {
        async fn dimensions(&self, _blob: &Bytes) -> PipelineResult<(u32, u32)> {
            Ok((100, 100))
        }

        async fn resize(&self, _blob: Bytes, _options: ResizeOptions) -> PipelineResult<Bytes> {
            let call = self.resizes.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail_first && call == 0 {
                return Err(PipelineError::Image("decoder gave up".into()));
            }
            Ok(Bytes::from(vec![7u8; self.output_len]))
        }

        async fn compress(&self, blob: Bytes, options: CompressOptions) -> PipelineResult<Bytes> {
            self.compresses.fetch_add(1, Ordering::SeqCst);
            Ok(blob.slice(..options.max_bytes().min(blob.len())))
        }
    }

    /// Memory cache whose second lookup answers with what it saw at call time,
    /// but only after a delay.
    #[derive(Default)]
    struct LaggingCache {
        inner: MemoryCacheStore,
        gets: AtomicUsize,
    }

    #[async_trait]
    impl CacheStore for LaggingCache {
        async fn get(&self, key: &str) -> PipelineResult<Option<Bytes>> {
            let seen = self.inner.get(key).await?;
            if self.gets.fetch_add(1, Ordering::SeqCst) == 1 {
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
            Ok(seen)
        }

        async fn put(&self, key: &str, blob: Bytes) -> PipelineResult<()> {
            self.inner.put(key, blob).await
        }

        async fn keys(&self) -> PipelineResult<Vec<String>> {
            self.inner.keys().await
        }

        async fn remove(&self, key: &str) -> PipelineResult<()> {
            self.inner.remove(key).await
        }

        async fn clear(&self) -> PipelineResult<()> {
            self.inner.clear().await
        }
    }

    async fn scripted(resizer: Arc<ScriptedResizer>, config: PipelineConfig) -> DerivativeProcessor {
        let blobs = Arc::new(MemoryBlobStore::new());
        blobs
            .save_asset("s", "assets/originals/photo.png", Bytes::from_static(b"source"))
            .await
            .unwrap();
        let cache = DerivativeCache::new(Arc::new(MemoryCacheStore::default()), &config);
        DerivativeProcessor::new(blobs, cache, resizer, config)
    }

    async fn setup() -> (DerivativeProcessor, Arc<MemoryBlobStore>) {
        let blobs = Arc::new(MemoryBlobStore::new());
        blobs
            .save_asset("s", "assets/originals/photo.png", png(120, 80))
            .await
            .unwrap();
        let config = PipelineConfig::default();
        let cache = DerivativeCache::new(Arc::new(MemoryCacheStore::default()), &config);
        let processor = DerivativeProcessor::new(blobs.clone(), cache, Arc::new(RasterResizer), config);
        (processor, blobs)
    }

    #[tokio::test]
    async fn generates_then_serves_from_cache() {
        let (processor, blobs) = setup().await;
        let options = TransformOptions::new(Some(60), Some(40)).with_crop(CropMode::Fill);
        let first = processor
            .get_display_blob("s", "assets/originals/photo.png", &options)
            .await
            .unwrap();
        assert_eq!(get_dimensions(&first).unwrap(), (60, 40));

        // The original is gone but the derivative still comes from the cache.
        blobs.delete_asset("s", "assets/originals/photo.png").await.unwrap();
        processor.clear_memory();
        let second = processor
            .get_display_blob("s", "assets/originals/photo.png", &options)
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn missing_source_is_terminal() {
        let (processor, _) = setup().await;
        let err = processor
            .get_display_blob("s", "assets/originals/nope.png", &TransformOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, PipelineError::source_not_found("assets/originals/nope.png"));
        assert_eq!(processor.in_flight(), 0);
    }

    #[tokio::test]
    async fn links_generated_derivative_into_registry() {
        let (processor, _) = setup().await;
        let registry = ImageRegistry::new(Arc::new(MemoryRegistryStore::new()));
        registry
            .add_image("s", "assets/originals/photo.png", ImageMetadata { size_bytes: 1, ..Default::default() })
            .await
            .unwrap();
        let processor = processor.with_registry(registry.clone());
        let options = TransformOptions::new(Some(10), None);
        processor
            .get_display_blob("s", "assets/originals/photo.png", &options)
            .await
            .unwrap();
        let entry = registry.get("s").await.unwrap().images["assets/originals/photo.png"].clone();
        let expected = DerivativeKey::new("s", "assets/originals/photo.png", &options).to_string();
        assert!(entry.derivative_paths.contains(&expected));
    }

    #[tokio::test]
    async fn invalidate_source_drops_its_derivatives_only() {
        let (processor, blobs) = setup().await;
        blobs
            .save_asset("s", "assets/originals/other.png", png(10, 10))
            .await
            .unwrap();
        let options = TransformOptions::new(Some(5), None);
        processor.get_display_blob("s", "assets/originals/photo.png", &options).await.unwrap();
        processor.get_display_blob("s", "assets/originals/other.png", &options).await.unwrap();
        assert_eq!(processor.invalidate_source("s", "assets/originals/photo.png").await, 1);
        assert_eq!(processor.cache().list_keys("s").await.len(), 1);
    }

    #[tokio::test]
    async fn originals_with_similar_paths_get_their_own_derivatives() {
        let (processor, blobs) = setup().await;
        let options = TransformOptions::default();
        let pairs = [
            ("assets/originals/a/b.png", "assets/originals/a__b.png"),
            ("assets/x/c.png", "assets/originals/x/c.png"),
        ];
        for (left, right) in pairs {
            blobs.save_asset("s", left, png(10, 10)).await.unwrap();
            blobs.save_asset("s", right, png(12, 12)).await.unwrap();
            let first = processor.get_display_blob("s", left, &options).await.unwrap();
            let second = processor.get_display_blob("s", right, &options).await.unwrap();
            assert_ne!(first, second, "{left} served {right}'s derivative");
            assert_eq!(get_dimensions(&second).unwrap(), (12, 12));
        }
    }

    #[tokio::test]
    async fn late_miss_reuses_the_stored_derivative() {
        let config = PipelineConfig::default();
        let blobs = Arc::new(MemoryBlobStore::new());
        blobs
            .save_asset("s", "assets/originals/photo.png", Bytes::from_static(b"source"))
            .await
            .unwrap();
        let cache = DerivativeCache::new(Arc::new(LaggingCache::default()), &config);
        let resizer = Arc::new(ScriptedResizer {
            output_len: 16,
            ..ScriptedResizer::default()
        });
        let processor = DerivativeProcessor::new(blobs, cache, resizer.clone(), config);
        let options = TransformOptions::new(Some(10), None);

        let (a, b) = tokio::join!(
            processor.get_display_blob("s", "assets/originals/photo.png", &options),
            processor.get_display_blob("s", "assets/originals/photo.png", &options),
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(resizer.resizes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn oversized_output_gets_one_compression_pass() {
        let config = PipelineConfig {
            compress_threshold_bytes: 100,
            ..PipelineConfig::default()
        };
        let big = Arc::new(ScriptedResizer {
            output_len: 500,
            ..ScriptedResizer::default()
        });
        let processor = scripted(big.clone(), config.clone()).await;
        let blob = processor
            .get_display_blob("s", "assets/originals/photo.png", &TransformOptions::new(Some(50), None))
            .await
            .unwrap();
        assert!(blob.len() <= 100);
        assert_eq!(big.compresses.load(Ordering::SeqCst), 1);

        let small = Arc::new(ScriptedResizer {
            output_len: 50,
            ..ScriptedResizer::default()
        });
        let processor = scripted(small.clone(), config).await;
        let blob = processor
            .get_display_blob("s", "assets/originals/photo.png", &TransformOptions::new(Some(50), None))
            .await
            .unwrap();
        assert_eq!(blob.len(), 50);
        assert_eq!(small.compresses.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stalled_resize_times_out() {
        let config = PipelineConfig {
            resize_timeout: Duration::from_millis(20),
            ..PipelineConfig::default()
        };
        let resizer = Arc::new(ScriptedResizer {
            output_len: 8,
            delay: Duration::from_millis(500),
            ..ScriptedResizer::default()
        });
        let processor = scripted(resizer, config).await;
        let err = processor
            .get_display_blob("s", "assets/originals/photo.png", &TransformOptions::new(Some(5), None))
            .await
            .unwrap_err();
        assert_eq!(err, PipelineError::CompressionTimeout { millis: 20 });
        assert_eq!(processor.in_flight(), 0);
        assert!(processor.cache().list_keys("s").await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failure_reaches_every_waiter_and_retry_regenerates() {
        let resizer = Arc::new(ScriptedResizer {
            output_len: 8,
            delay: Duration::from_millis(150),
            fail_first: true,
            ..ScriptedResizer::default()
        });
        let processor = scripted(resizer.clone(), PipelineConfig::default()).await;
        let options = TransformOptions::new(Some(5), None);

        let mut waiters = Vec::new();
        for _ in 0..5 {
            let processor = processor.clone();
            waiters.push(tokio::spawn(async move {
                processor
                    .get_display_blob("s", "assets/originals/photo.png", &options)
                    .await
            }));
        }
        for waiter in waiters {
            let err = waiter.await.unwrap().unwrap_err();
            assert_eq!(err, PipelineError::Image("decoder gave up".into()));
        }
        assert_eq!(resizer.resizes.load(Ordering::SeqCst), 1);
        assert_eq!(processor.in_flight(), 0);

        let blob = processor
            .get_display_blob("s", "assets/originals/photo.png", &options)
            .await
            .unwrap();
        assert_eq!(blob.len(), 8);
        assert_eq!(resizer.resizes.load(Ordering::SeqCst), 2);
    }
}
