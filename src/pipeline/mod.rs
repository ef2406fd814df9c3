//! The `Pipeline` orchestrator (spec.md §4.3): public entry point, task
//! factory, configuration, and the cache/prefetch facades built on top of
//! it.
//!
//! Grounded in `ferrex-core/src/image_service.rs`'s `ImageService`: a
//! single struct holding every collaborator (loader, caches, codecs,
//! semaphores) behind `Arc`s, constructed once via a builder and then
//! shared across callers as `Arc<ImageService>`.

pub mod queues;

mod decode;
mod decompress;
mod load_data;
mod load_image;
mod process;
#[cfg(test)]
mod tests_support;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

pub use load_data::DataChunk;

use crate::config::PipelineConfig;
use crate::container::{CacheType, ImageResponse};
use crate::data_cache::DataCache;
use crate::decoder::{DecoderRegistry, Encoder, ImageCrateEncoder};
use crate::error::{PipelineError, Result};
use crate::keys::{data_cache_key, image_cache_key, ImageCacheKey, LoadKey, ProcessKey};
use crate::loader::DataLoader;
use crate::memory_cache::{CacheStats, MemoryCache, MemoryCacheConfig};
use crate::prefetcher::{PrefetchDestination, Prefetcher};
use crate::rate_limiter::RateLimiter;
use crate::request::{Priority, Request};
use crate::resumable::ResumableDataStore;
use crate::task::arena::TaskArena;
use crate::task::{Event, Subscription, Task};

/// The pipeline's single owning struct. Always used behind `Arc` — every
/// task closure and the `Prefetcher` hold either a strong or weak
/// reference back into it.
pub struct Pipeline {
    config: PipelineConfig,
    data_loader: Arc<dyn DataLoader>,
    data_cache: Option<Arc<dyn DataCache>>,
    memory_cache: MemoryCache,
    decoder_registry: DecoderRegistry,
    encoder: Arc<dyn Encoder>,
    rate_limiter: Option<RateLimiter>,
    resumable: Option<Arc<ResumableDataStore>>,
    queues: queues::Queues,
    load_data_arena: TaskArena<LoadKey, DataChunk>,
    decode_arena: TaskArena<LoadKey, crate::container::ImageContainer>,
    process_arena: TaskArena<ProcessKey, crate::container::ImageContainer>,
    load_image_arena: TaskArena<ImageCacheKey, ImageResponse>,
    invalidated: AtomicBool,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("invalidated", &self.invalidated.load(Ordering::Relaxed))
            .field("queues", &self.queues)
            .finish_non_exhaustive()
    }
}

/// Builds a [`Pipeline`], matching spec.md §4.3's configuration list: one
/// required collaborator (`data_loader`), everything else optional with a
/// sensible default.
pub struct PipelineBuilder {
    data_loader: Arc<dyn DataLoader>,
    data_cache: Option<Arc<dyn DataCache>>,
    memory_cache: Option<MemoryCache>,
    decoder_registry: DecoderRegistry,
    encoder: Arc<dyn Encoder>,
    config: PipelineConfig,
}

impl PipelineBuilder {
    pub fn new(data_loader: Arc<dyn DataLoader>) -> Self {
        Self {
            data_loader,
            data_cache: None,
            memory_cache: None,
            decoder_registry: DecoderRegistry::new(),
            encoder: Arc::new(ImageCrateEncoder::default()),
            config: PipelineConfig::default(),
        }
    }

    pub fn data_cache(mut self, data_cache: Arc<dyn DataCache>) -> Self {
        self.data_cache = Some(data_cache);
        self
    }

    pub fn memory_cache(mut self, memory_cache: MemoryCache) -> Self {
        self.memory_cache = Some(memory_cache);
        self
    }

    pub fn decoder_registry(mut self, decoder_registry: DecoderRegistry) -> Self {
        self.decoder_registry = decoder_registry;
        self
    }

    pub fn encoder(mut self, encoder: Arc<dyn Encoder>) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Arc<Pipeline> {
        let rate_limiter = self.config.is_rate_limiter_enabled.then(|| {
            RateLimiter::new(crate::rate_limiter::RateLimiterConfig {
                requests_per_second: self.config.rate_limiter.requests_per_second,
                burst: self.config.rate_limiter.burst,
            })
        });
        let resumable = self
            .config
            .is_resumable_data_enabled
            .then(|| Arc::new(ResumableDataStore::new()));

        Arc::new(Pipeline {
            queues: queues::Queues::new(self.config.queues),
            config: self.config,
            data_loader: self.data_loader,
            data_cache: self.data_cache,
            memory_cache: self.memory_cache.unwrap_or_else(|| MemoryCache::new(MemoryCacheConfig::default())),
            decoder_registry: self.decoder_registry,
            encoder: self.encoder,
            rate_limiter,
            resumable,
            load_data_arena: TaskArena::new(),
            decode_arena: TaskArena::new(),
            process_arena: TaskArena::new(),
            load_image_arena: TaskArena::new(),
            invalidated: AtomicBool::new(false),
        })
    }
}

/// Per-task callbacks, generic over the task's value type so the same
/// shape serves both `loadImage` (`ImageResponse`) and `loadData`
/// (`DataChunk`) per spec.md §4.3.
pub struct TaskHandlers<V> {
    pub on_progress: Option<Box<dyn Fn(u64, Option<u64>) + Send + Sync>>,
    pub on_value: Option<Box<dyn Fn(V, bool) + Send + Sync>>,
    pub on_error: Option<Box<dyn Fn(PipelineError) + Send + Sync>>,
}

impl<V> Default for TaskHandlers<V> {
    fn default() -> Self {
        Self {
            on_progress: None,
            on_value: None,
            on_error: None,
        }
    }
}

impl<V> TaskHandlers<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_progress(mut self, f: impl Fn(u64, Option<u64>) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    pub fn on_value(mut self, f: impl Fn(V, bool) + Send + Sync + 'static) -> Self {
        self.on_value = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(PipelineError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

pub type ImageTaskHandlers = TaskHandlers<ImageResponse>;
pub type DataTaskHandlers = TaskHandlers<DataChunk>;

/// Handle returned by `loadImage`/`loadData` (spec.md §4.3's `ImageTask`).
/// Dropping it unsubscribes from the underlying coalesced task, cancelling
/// it if this was the last live subscriber (spec.md §4.1 invariant 1), and
/// stops delivering callbacks.
pub struct ImageTask<V> {
    subscription: Option<Subscription<V>>,
    drain: tokio::task::JoinHandle<()>,
}

impl<V: Send + Sync + 'static> ImageTask<V> {
    pub fn set_priority(&self, priority: Priority) {
        if let Some(subscription) = &self.subscription {
            subscription.set_priority(priority);
        }
    }

    /// Cancel this subscription early, same effect as dropping the handle:
    /// drops the underlying subscription (unsubscribing from the
    /// coalesced task, cancelling it and releasing its dependencies if
    /// this was the last live subscriber) instead of merely downgrading
    /// its priority.
    pub fn cancel(&mut self) {
        self.drain.abort();
        self.subscription = None;
    }
}

impl<V> Drop for ImageTask<V> {
    fn drop(&mut self) {
        self.drain.abort();
    }
}

fn spawn_handlers<V>(task: Arc<Task<V>>, priority: Priority, handlers: TaskHandlers<V>) -> ImageTask<V>
where
    V: Clone + Send + Sync + 'static,
{
    let (subscription, mut rx) = task.subscribe(priority);
    let drain = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                Event::Progress { completed, total } => {
                    if let Some(f) = &handlers.on_progress {
                        f(completed, total);
                    }
                }
                Event::Value { value, is_final } => {
                    if let Some(f) = &handlers.on_value {
                        f(value, is_final);
                    }
                    if is_final {
                        break;
                    }
                }
                Event::Error(error) => {
                    if let Some(f) = &handlers.on_error {
                        f(error);
                    }
                    break;
                }
            }
        }
    });
    ImageTask {
        subscription: Some(subscription),
        drain,
    }
}

/// Immediately-failing `ImageTask` for requests submitted after
/// `invalidate()` (spec.md §4.3/§7: `pipelineInvalidated`).
fn invalidated_task<V>(handlers: TaskHandlers<V>) -> ImageTask<V>
where
    V: Clone + Send + Sync + 'static,
{
    let task: Arc<Task<V>> = Task::new_cold(|task| async move {
        task.emit_error(PipelineError::PipelineInvalidated);
    });
    spawn_handlers(task, Priority::Normal, handlers)
}

/// Which cache tier(s) a [`CacheFacade`] operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheScope {
    Memory,
    Disk,
    Both,
}

/// `cache` facade (spec.md §4.3): `get`/`set`/`remove`/`contains` over
/// memory, disk, or both, addressed by the same keys `loadImage` uses so
/// a caller can pre-seed or evict without going through a full load.
pub struct CacheFacade {
    pipeline: Arc<Pipeline>,
}

impl CacheFacade {
    pub async fn get(&self, request: &Request, scope: CacheScope) -> Option<Arc<ImageResponse>> {
        let key = image_cache_key(request);

        if matches!(scope, CacheScope::Memory | CacheScope::Both) {
            if let Some(hit) = self.pipeline.memory_cache.get(&key).await {
                return Some(hit);
            }
        }

        if matches!(scope, CacheScope::Disk | CacheScope::Both) {
            if let Some(data_cache) = &self.pipeline.data_cache {
                if let Ok(Some(bytes)) = data_cache.cached_data(key.as_str()).await {
                    if let Some(container) = load_image::decode_complete_bytes(&self.pipeline, &bytes) {
                        return Some(Arc::new(ImageResponse::new(container, CacheType::Disk)));
                    }
                }
            }
        }

        None
    }

    pub async fn set(&self, request: &Request, response: Arc<ImageResponse>, scope: CacheScope) {
        let key = image_cache_key(request);

        if matches!(scope, CacheScope::Memory | CacheScope::Both) {
            self.pipeline.memory_cache.insert(key.clone(), response.clone()).await;
        }

        if matches!(scope, CacheScope::Disk | CacheScope::Both) {
            if let Some(data_cache) = &self.pipeline.data_cache {
                let encoder = self.pipeline.encoder.clone();
                let image = response.container.image.clone();
                let image_type = response.container.image_type;
                let stage = self.pipeline.queues.encoding.clone();
                if let Ok(bytes) = queues::run_blocking_on(&stage, move || encoder.encode(&image, image_type)).await {
                    if let Err(error) = data_cache.store_data(key.as_str(), &bytes).await {
                        debug!(%error, "cache facade failed to write encoded image to disk");
                    }
                }
            }
        }
    }

    pub async fn remove(&self, request: &Request, scope: CacheScope) {
        let key = image_cache_key(request);
        if matches!(scope, CacheScope::Memory | CacheScope::Both) {
            self.pipeline.memory_cache.remove(&key).await;
        }
        if matches!(scope, CacheScope::Disk | CacheScope::Both) {
            if let Some(data_cache) = &self.pipeline.data_cache {
                let _ = data_cache.remove_data(key.as_str()).await;
            }
        }
    }

    pub async fn contains(&self, request: &Request, scope: CacheScope) -> bool {
        self.get(request, scope).await.is_some()
    }
}

/// Snapshot of pipeline health, grounded in `ImageService::get_stats`
/// (spec.md §4.13, ambient — not gated by any Non-goal).
#[derive(Debug, Clone)]
pub struct PipelineStats {
    pub load_data_in_flight: usize,
    pub decode_in_flight: usize,
    pub process_in_flight: usize,
    pub load_image_in_flight: usize,
    pub memory_cache: CacheStats,
}

impl Pipeline {
    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    /// `loadImage(request, priority, handlers) → ImageTask` (spec.md
    /// §4.3/§4.4).
    pub fn load_image(
        self: &Arc<Self>,
        request: Request,
        priority: Priority,
        handlers: ImageTaskHandlers,
    ) -> ImageTask<ImageResponse> {
        if self.is_invalidated() {
            return invalidated_task(handlers);
        }
        let (_key, task) = load_image::task_for(self, &request);
        spawn_handlers(task, priority, handlers)
    }

    /// `loadData(request, priority, handlers) → ImageTask`, the
    /// bytes-only variant that short-circuits after `LoadImageData`
    /// (spec.md §4.3/§4.5).
    pub fn load_data(
        self: &Arc<Self>,
        request: Request,
        priority: Priority,
        handlers: DataTaskHandlers,
    ) -> ImageTask<DataChunk> {
        if self.is_invalidated() {
            return invalidated_task(handlers);
        }
        let (_key, task) = load_data::task_for(self, &request);
        spawn_handlers(task, priority, handlers)
    }

    pub fn cache(self: &Arc<Self>) -> CacheFacade {
        CacheFacade {
            pipeline: self.clone(),
        }
    }

    /// `prefetcher(destination, maxConcurrency)` (spec.md §4.3/§4.12).
    pub fn prefetcher(self: &Arc<Self>, max_concurrent_prefetches: usize) -> Prefetcher {
        Prefetcher::new(Arc::downgrade(self), max_concurrent_prefetches)
    }

    /// One step of the prefetcher's dispatch loop: drives a request to
    /// its terminal event at [`Priority::VeryLow`] without handing the
    /// caller any callbacks, populating the destination cache tier as a
    /// side effect (spec.md §4.12).
    pub async fn prefetch_one(self: &Arc<Self>, request: Request, destination: PrefetchDestination) -> Result<()> {
        if self.is_invalidated() {
            return Err(PipelineError::PipelineInvalidated);
        }
        match destination {
            PrefetchDestination::DiskCache => {
                let (_key, task) = load_data::task_for(self, &request);
                drain_to_terminal(task).await
            }
            PrefetchDestination::MemoryCache => {
                let (_key, task) = load_image::task_for(self, &request);
                drain_to_terminal(task).await
            }
        }
    }

    /// `invalidate()` (spec.md §4.3): transitions to a terminal state.
    /// Existing in-flight tasks are left to finish on their own — only
    /// new `loadImage`/`loadData`/`prefetch_one` calls are rejected.
    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::SeqCst);
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            load_data_in_flight: self.load_data_arena.len(),
            decode_in_flight: self.decode_arena.len(),
            process_in_flight: self.process_arena.len(),
            load_image_in_flight: self.load_image_arena.len(),
            memory_cache: self.memory_cache.stats(),
        }
    }
}

async fn drain_to_terminal<V: Send + Sync + 'static>(task: Arc<Task<V>>) -> Result<()> {
    let (_sub, mut rx) = task.subscribe(Priority::VeryLow);
    while let Some(event) = rx.recv().await {
        match event {
            Event::Error(error) => return Err(error),
            Event::Value { is_final: true, .. } => return Ok(()),
            _ => continue,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests_support::StaticDataLoader;

    #[tokio::test]
    async fn invalidate_rejects_new_loads() {
        let pipeline = PipelineBuilder::new(Arc::new(StaticDataLoader::new(vec![b"x".to_vec()]))).build();
        pipeline.invalidate();

        let request = Request::new("https://example.com/a.jpg");
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        let handlers = ImageTaskHandlers::new().on_error(move |error| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(error);
            }
        });
        let _task = pipeline.load_image(request, Priority::Normal, handlers);
        let error = rx.await.unwrap();
        assert!(matches!(error, PipelineError::PipelineInvalidated));
    }

    #[tokio::test]
    async fn stats_reports_in_flight_counts() {
        let pipeline = PipelineBuilder::new(Arc::new(StaticDataLoader::new(vec![b"x".to_vec()]))).build();
        let request = Request::new("https://example.com/b.jpg");
        let handlers = ImageTaskHandlers::new();
        let task = pipeline.load_image(request, Priority::Normal, handlers);
        assert_eq!(pipeline.stats().load_image_in_flight, 1);
        drop(task);
    }

    #[tokio::test]
    async fn cache_facade_set_then_get_hits_memory() {
        use crate::container::{ImageContainer, ImageType};
        use image::DynamicImage;

        let pipeline = PipelineBuilder::new(Arc::new(StaticDataLoader::new(vec![]))).build();
        let request = Request::new("https://example.com/c.jpg");
        let response = Arc::new(ImageResponse::new(
            ImageContainer::final_(DynamicImage::new_rgb8(4, 4), ImageType::Png),
            CacheType::None,
        ));

        let cache = pipeline.cache();
        cache.set(&request, response.clone(), CacheScope::Memory).await;
        let hit = cache.get(&request, CacheScope::Memory).await;
        assert!(hit.is_some());
        assert!(cache.contains(&request, CacheScope::Memory).await);

        cache.remove(&request, CacheScope::Memory).await;
        assert!(!cache.contains(&request, CacheScope::Memory).await);
    }
}
