//! Coalescing map from a cache key to a live, shared [`Task`].
//!
//! One arena exists per task kind (`LoadImageData`, `DecodeImage`, ...) in
//! [`crate::pipeline::Pipeline`], mirroring the per-kind `in_flight`
//! dedup sets in `ferrex-core/src/image_service.rs` rather than a single
//! arena shared across heterogeneous value types.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, Weak};

use super::{Task, TaskState};

pub struct TaskArena<K, V> {
    entries: Mutex<HashMap<K, Weak<Task<V>>>>,
}

impl<K, V> Default for TaskArena<K, V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone, V: Send + Sync + 'static> TaskArena<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the live task for `key`, creating one via `start` if none
    /// exists or the existing one already finished. Two callers racing on
    /// the same key observe the same `Arc<Task<V>>` and so coalesce.
    pub fn get_or_create<F, Fut>(&self, key: K, start: F) -> Arc<Task<V>>
    where
        F: FnOnce(Arc<Task<V>>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.get_or_create_if(key, true, start)
    }

    /// Like [`TaskArena::get_or_create`], but when `dedup` is `false` always
    /// mints a fresh, unshared task instead of looking up (or registering)
    /// an existing one under `key` — spec.md §4.3's
    /// `isDeduplicationEnabled(false)`: "each request produces an
    /// independent task chain".
    pub fn get_or_create_if<F, Fut>(&self, key: K, dedup: bool, start: F) -> Arc<Task<V>>
    where
        F: FnOnce(Arc<Task<V>>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if !dedup {
            return Task::new_cold(start);
        }

        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries.get(&key).and_then(Weak::upgrade) {
            if !matches!(existing.state(), TaskState::Cancelled | TaskState::Completed) {
                return existing;
            }
        }
        let task = Task::new_cold(start);
        entries.insert(key, Arc::downgrade(&task));
        task
    }

    /// Number of entries tracked, including stale (finished) ones not yet
    /// overwritten. Exposed for stats/diagnostics only.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Drop weak references whose task has already finished. Cheap
    /// housekeeping the pipeline can run periodically so the map doesn't
    /// grow unbounded under a long-lived process with many distinct keys.
    pub fn sweep(&self) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, weak| weak.upgrade().is_some());
    }
}
