//! `imagepipe`: an async, coalescing, cache-aware image loading pipeline
//! core. Callers supply the external collaborators (a [`loader::DataLoader`],
//! optionally a [`data_cache::DataCache`], and codecs via
//! [`decoder::Decoder`]/[`decoder::Encoder`]) and drive everything else
//! through [`pipeline::Pipeline`].

pub mod config;
pub mod container;
pub mod data_cache;
pub mod decoder;
pub mod error;
pub mod keys;
pub mod loader;
pub mod memory_cache;
pub mod pipeline;
pub mod prefetcher;
pub mod processing;
pub mod rate_limiter;
pub mod request;
pub mod resumable;
pub mod task;
pub mod testing;

pub use config::{DataCachePolicy, PipelineConfig, QueueConfig, QueuesConfig, RateLimiterSettings};
pub use container::{CacheType, ImageContainer, ImageResponse, ImageType};
pub use data_cache::{CacacheDataCache, DataCache};
pub use decoder::{Decoder, DecoderRegistry, Encoder, ImageCrateDecoder, ImageCrateEncoder, ProgressiveJpegDecoder};
pub use error::{PipelineError, Result};
pub use keys::{DataCacheKey, ImageCacheKey, LoadKey, ProcessKey};
pub use loader::{CancelledFn, DataLoader, LoadedData, PartialData, PartialFailureFn, ProgressFn};
pub use memory_cache::{CacheStats, MemoryCache, MemoryCacheConfig};
pub use pipeline::{
    CacheFacade, CacheScope, DataChunk, DataTaskHandlers, ImageTask, ImageTaskHandlers, Pipeline, PipelineBuilder,
    PipelineStats, TaskHandlers,
};
pub use prefetcher::{PrefetchDestination, Prefetcher};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use request::{Priority, Processor, ProcessorRef, Request, RequestOptions, Source};
pub use resumable::ResumableDataStore;
pub use task::{Event, Task, TaskId, TaskState};
