//! `PipelineConfig`: the single source of tunables for an
//! [`crate::pipeline::Pipeline`] instance (spec.md §4.3).
//!
//! Mirrors the teacher's plain-struct-plus-`Default` configuration pattern
//! (`ferrex-core/src/config` / `OrchestratorConfig`) rather than a
//! builder-of-builders: one struct, all fields public, `..Default::default()`
//! for overrides.

use std::num::NonZeroU32;

/// Which bytes get written to the [`crate::data_cache::DataCache`] on a
/// successful load (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataCachePolicy {
    /// Store original (undecoded) bytes when there's no processed form
    /// worth caching on its own, store the processed form when there are
    /// no original bytes worth keeping around (e.g. re-encoded to save
    /// space). The teacher's `ImageBlobStore` default.
    #[default]
    Automatic,
    /// Always store the original downloaded bytes under `dataCacheKey`;
    /// never store a separately-encoded processed image.
    StoreOriginalData,
    /// Always store the final processed image (post-processors,
    /// re-encoded) under `imageCacheKey`; never store raw original bytes.
    StoreEncodedImages,
    /// Store both.
    StoreAll,
}

impl DataCachePolicy {
    pub fn stores_original(&self) -> bool {
        matches!(self, Self::Automatic | Self::StoreOriginalData | Self::StoreAll)
    }

    pub fn stores_encoded(&self) -> bool {
        matches!(self, Self::StoreEncodedImages | Self::StoreAll)
    }
}

/// Bounded concurrency for one stage's worker queue.
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub max_concurrent_operation_count: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_operation_count: 6,
        }
    }
}

impl QueueConfig {
    pub fn new(max_concurrent_operation_count: usize) -> Self {
        Self {
            max_concurrent_operation_count: max_concurrent_operation_count.max(1),
        }
    }
}

/// Per-stage queue sizing (spec.md §4.3's bulleted per-stage queue list).
#[derive(Debug, Clone, Copy)]
pub struct QueuesConfig {
    pub data_loading: QueueConfig,
    pub data_caching: QueueConfig,
    pub decoding: QueueConfig,
    pub encoding: QueueConfig,
    pub processing: QueueConfig,
    pub decompressing: QueueConfig,
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            data_loading: QueueConfig::new(6),
            data_caching: QueueConfig::new(2),
            decoding: QueueConfig::new(1),
            encoding: QueueConfig::new(1),
            processing: QueueConfig::new(2),
            decompressing: QueueConfig::new(2),
        }
    }
}

/// Tunables for the bundled [`crate::rate_limiter::RateLimiter`].
#[derive(Debug, Clone, Copy)]
pub struct RateLimiterSettings {
    pub requests_per_second: NonZeroU32,
    pub burst: NonZeroU32,
}

impl Default for RateLimiterSettings {
    fn default() -> Self {
        Self {
            requests_per_second: NonZeroU32::new(20).unwrap(),
            burst: NonZeroU32::new(20).unwrap(),
        }
    }
}

/// All pipeline-wide tunables. `data_loader` is the only field without a
/// default — everything else has one, matching spec.md §4.3's "required"
/// vs. "optional" split.
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub is_deduplication_enabled: bool,
    pub is_progressive_decoding_enabled: bool,
    pub is_storing_previews_in_memory_cache: bool,
    pub is_resumable_data_enabled: bool,
    pub is_rate_limiter_enabled: bool,
    pub is_decompression_enabled: bool,
    pub data_cache_policy: DataCachePolicy,
    pub queues: QueuesConfig,
    pub rate_limiter: RateLimiterSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            is_deduplication_enabled: true,
            is_progressive_decoding_enabled: false,
            is_storing_previews_in_memory_cache: false,
            is_resumable_data_enabled: true,
            is_rate_limiter_enabled: true,
            is_decompression_enabled: true,
            data_cache_policy: DataCachePolicy::StoreOriginalData,
            queues: QueuesConfig::default(),
            rate_limiter: RateLimiterSettings::default(),
        }
    }
}
