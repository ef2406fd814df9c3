//! Bounded per-stage worker queues (spec.md §4.3/§4.13's `dataLoading`,
//! `dataCaching`, `decoding`, `encoding`, `processing`, `decompressing`).
//!
//! Grounded in `ImageService`'s `permits: Arc<Semaphore>` field
//! (`ferrex-core/src/image_service.rs`): a `tokio::sync::Semaphore` caps
//! concurrency, and CPU-bound work runs via `spawn_blocking` so it doesn't
//! starve the async executor — the same pattern `ImageService` uses for
//! ffmpeg thumbnail extraction.

use std::sync::Arc;

use tokio::sync::{Semaphore, SemaphorePermit};

use crate::config::QueuesConfig;
use crate::error::{PipelineError, Result};

#[derive(Clone)]
pub struct Stage {
    semaphore: Arc<Semaphore>,
}

impl Stage {
    fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub async fn acquire(&self) -> SemaphorePermit<'_> {
        self.semaphore
            .acquire()
            .await
            .expect("stage semaphore is never closed")
    }

    pub fn occupied(&self) -> usize {
        // available_permits() only tells us the free count; total minus
        // free isn't tracked separately, so expose availability instead —
        // callers (stats) report it as "free slots" rather than guessing
        // total capacity back out.
        self.semaphore.available_permits()
    }
}

/// One [`Stage`] per pipeline worker queue named in spec.md §4.3.
#[derive(Clone)]
pub struct Queues {
    pub data_loading: Stage,
    pub data_caching: Stage,
    pub decoding: Stage,
    pub encoding: Stage,
    pub processing: Stage,
    pub decompressing: Stage,
}

impl Queues {
    pub fn new(config: QueuesConfig) -> Self {
        Self {
            data_loading: Stage::new(config.data_loading.max_concurrent_operation_count),
            data_caching: Stage::new(config.data_caching.max_concurrent_operation_count),
            decoding: Stage::new(config.decoding.max_concurrent_operation_count),
            encoding: Stage::new(config.encoding.max_concurrent_operation_count),
            processing: Stage::new(config.processing.max_concurrent_operation_count),
            decompressing: Stage::new(config.decompressing.max_concurrent_operation_count),
        }
    }
}

impl std::fmt::Debug for Queues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queues")
            .field("data_loading_free", &self.data_loading.occupied())
            .field("data_caching_free", &self.data_caching.occupied())
            .field("decoding_free", &self.decoding.occupied())
            .field("encoding_free", &self.encoding.occupied())
            .field("processing_free", &self.processing.occupied())
            .field("decompressing_free", &self.decompressing.occupied())
            .finish()
    }
}

/// Runs a CPU-bound closure on the blocking thread pool while holding a
/// permit on `stage`, mapping a join error to [`PipelineError::Internal`].
pub async fn run_blocking_on<F, T>(stage: &Stage, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let _permit = stage.acquire().await;
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PipelineError::Internal(format!("worker thread panicked: {e}")))?
}
