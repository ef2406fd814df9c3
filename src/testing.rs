//! Fake `DataLoader`/`DataCache` implementations used by this crate's own
//! unit tests and by the integration tests under `tests/`. Kept as a
//! regular (non-`#[cfg(test)]`) module, since integration tests compile
//! as a separate crate and can't see `#[cfg(test)]` items from `lib.rs`.
//!
//! Grounded in the teacher's test-double conventions under
//! `ferrex-player/src/infra/testing/stubs`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::data_cache::DataCache;
use crate::error::{PipelineError, Result};
use crate::loader::{CancelledFn, DataLoader, LoadedData, PartialData, PartialFailureFn, ProgressFn};
use crate::request::Request;

/// Delivers a fixed sequence of byte chunks, concatenated, with no
/// network involved. Counts how many times `load` was invoked so tests
/// can assert on coalescing (spec.md §8 invariant 2).
pub struct StaticDataLoader {
    chunks: Vec<Vec<u8>>,
    calls: AtomicUsize,
}

impl StaticDataLoader {
    pub fn new(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            chunks,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataLoader for StaticDataLoader {
    async fn load(
        &self,
        _request: &Request,
        _resume: Option<PartialData>,
        on_progress: ProgressFn<'_>,
        is_cancelled: CancelledFn<'_>,
        _on_partial_failure: PartialFailureFn<'_>,
    ) -> Result<LoadedData> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let total = Some(self.chunks.iter().map(|c| c.len()).sum::<usize>() as u64);
        let mut body = Vec::new();
        for (i, chunk) in self.chunks.iter().enumerate() {
            if is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            body.extend_from_slice(chunk);
            // The last chunk is folded into the `LoadedData` this returns
            // instead of also going out as a non-terminal progress value.
            if i + 1 < self.chunks.len() {
                on_progress(&body, total);
            }
        }
        if body.is_empty() {
            return Err(PipelineError::DataIsEmpty);
        }
        Ok(LoadedData {
            total_size: Some(body.len() as u64),
            bytes: body,
            resumed: false,
            validator: None,
        })
    }
}

/// A `DataLoader` that suspends until explicitly released, for exercising
/// coalescing under true concurrency (spec.md §8 scenario S3: "DataLoader
/// suspended until the 5th subscription").
pub struct SuspendableDataLoader {
    chunks: Vec<Vec<u8>>,
    calls: AtomicUsize,
    release: Notify,
    released: std::sync::atomic::AtomicBool,
}

impl SuspendableDataLoader {
    pub fn new(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            chunks,
            calls: AtomicUsize::new(0),
            release: Notify::new(),
            released: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        self.release.notify_waiters();
    }
}

#[async_trait]
impl DataLoader for SuspendableDataLoader {
    async fn load(
        &self,
        _request: &Request,
        _resume: Option<PartialData>,
        on_progress: ProgressFn<'_>,
        _is_cancelled: CancelledFn<'_>,
        _on_partial_failure: PartialFailureFn<'_>,
    ) -> Result<LoadedData> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        while !self.released.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
        let total = Some(self.chunks.iter().map(|c| c.len()).sum::<usize>() as u64);
        let mut body = Vec::new();
        for (i, chunk) in self.chunks.iter().enumerate() {
            body.extend_from_slice(chunk);
            if i + 1 < self.chunks.len() {
                on_progress(&body, total);
            }
        }
        Ok(LoadedData {
            total_size: Some(body.len() as u64),
            bytes: body,
            resumed: false,
            validator: None,
        })
    }
}

/// A `DataLoader` that always fails without doing any work. Useful for
/// asserting a code path never falls through to the network (e.g. a
/// data-cache or memory-cache hit).
pub struct FailingDataLoader {
    message: String,
}

impl FailingDataLoader {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl DataLoader for FailingDataLoader {
    async fn load(
        &self,
        _request: &Request,
        _resume: Option<PartialData>,
        _on_progress: ProgressFn<'_>,
        _is_cancelled: CancelledFn<'_>,
        _on_partial_failure: PartialFailureFn<'_>,
    ) -> Result<LoadedData> {
        Err(PipelineError::DataLoadingFailed(self.message.clone()))
    }
}

/// In-memory `DataCache`, for tests that need a working disk-cache facade
/// without touching the filesystem.
#[derive(Default)]
pub struct InMemoryDataCache {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryDataCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, key: impl std::fmt::Display, bytes: Vec<u8>) {
        self.entries.lock().await.insert(key.to_string(), bytes);
    }
}

#[async_trait]
impl DataCache for InMemoryDataCache {
    async fn cached_data(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn store_data(&self, key: &str, data: &[u8]) -> Result<()> {
        self.entries.lock().await.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn remove_data(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn remove_all(&self) -> Result<()> {
        self.entries.lock().await.clear();
        Ok(())
    }
}

pub fn sample_png_bytes(width: u32, height: u32) -> Vec<u8> {
    use image::{DynamicImage, ImageFormat};
    use std::io::Cursor;

    let image = DynamicImage::new_rgba8(width, height);
    let mut buffer = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
        .expect("encoding an in-memory PNG never fails");
    buffer
}

pub type SharedDataCache = Arc<InMemoryDataCache>;
