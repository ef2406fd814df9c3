//! `Prefetcher`: background, low-priority population of the caches ahead
//! of an actual request (spec.md §4.12).
//!
//! The teacher doesn't have a dedicated prefetch subsystem for images, but
//! its scan orchestration (`ferrex-core/src/scan/orchestration/actors/pipeline/image_fetch.rs`
//! and `.../runtime/supervisor.rs`) shows the same shape this needs: a
//! bounded worker pool pulling jobs off a queue, tagged with a priority
//! hint, cancellable mid-flight. This module adapts that shape to a
//! plain in-process queue instead of the scan orchestrator's actor/command
//! plumbing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::keys::{image_cache_key, ImageCacheKey};
use crate::pipeline::Pipeline;
use crate::request::{Priority, Request};

/// How far a prefetch should push a request's bytes: just onto disk, or
/// all the way through decode into the memory cache too.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchDestination {
    DiskCache,
    MemoryCache,
}

struct PrefetchJob {
    request: Request,
    destination: PrefetchDestination,
}

struct Shared {
    pipeline: Weak<Pipeline>,
    queue: Mutex<VecDeque<PrefetchJob>>,
    paused: AtomicBool,
    wake: Notify,
    /// Keyed by `imageCacheKey` so [`Prefetcher::stop_prefetching`] can
    /// abort the handles matching specific requests instead of every
    /// in-flight prefetch.
    in_flight: Mutex<Vec<(ImageCacheKey, JoinHandle<()>)>>,
}

/// Downgrades request priority and feeds a bounded worker pool that calls
/// back into the owning [`Pipeline`]. Requests already in flight for the
/// same image (an explicit, non-prefetch load) are unaffected — prefetch
/// jobs coalesce with them at the `Task` layer, same as any other request.
pub struct Prefetcher {
    shared: Arc<Shared>,
    permits: Arc<Semaphore>,
}

impl std::fmt::Debug for Prefetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prefetcher")
            .field("queued", &self.shared.queue.lock().unwrap().len())
            .field("paused", &self.shared.paused.load(Ordering::Relaxed))
            .finish()
    }
}

impl Prefetcher {
    /// `max_concurrent_prefetches` bounds how many prefetch loads run at
    /// once, independent of the pipeline's own per-stage concurrency caps.
    pub fn new(pipeline: Weak<Pipeline>, max_concurrent_prefetches: usize) -> Self {
        let shared = Arc::new(Shared {
            pipeline,
            queue: Mutex::new(VecDeque::new()),
            paused: AtomicBool::new(false),
            wake: Notify::new(),
            in_flight: Mutex::new(Vec::new()),
        });
        let permits = Arc::new(Semaphore::new(max_concurrent_prefetches.max(1)));
        let dispatcher = shared.clone();
        let dispatcher_permits = permits.clone();
        tokio::spawn(async move {
            run_dispatcher(dispatcher, dispatcher_permits).await;
        });
        Self { shared, permits }
    }

    /// Queue requests for background loading at [`Priority::VeryLow`].
    pub fn start_prefetching(&self, requests: impl IntoIterator<Item = Request>, destination: PrefetchDestination) {
        let mut queue = self.shared.queue.lock().unwrap();
        for request in requests {
            let request = request.with_priority(Priority::VeryLow);
            queue.push_back(PrefetchJob { request, destination });
        }
        drop(queue);
        self.shared.wake.notify_waiters();
    }

    /// Cancel the outstanding prefetch jobs matching `requests`: drop them
    /// from the queue if not yet started, abort their handle if already in
    /// flight. Jobs for other requests, and non-prefetch (explicit) loads
    /// for the same images, are left untouched.
    pub fn stop_prefetching(&self, requests: impl IntoIterator<Item = Request>) {
        let keys: std::collections::HashSet<ImageCacheKey> =
            requests.into_iter().map(|r| image_cache_key(&r)).collect();
        if keys.is_empty() {
            return;
        }

        self.shared
            .queue
            .lock()
            .unwrap()
            .retain(|job| !keys.contains(&image_cache_key(&job.request)));

        let mut in_flight = self.shared.in_flight.lock().unwrap();
        in_flight.retain(|(key, handle)| {
            if keys.contains(key) {
                handle.abort();
                false
            } else {
                true
            }
        });
    }

    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
        self.shared.wake.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Relaxed)
    }

    pub fn queued_count(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

async fn run_dispatcher(shared: Arc<Shared>, permits: Arc<Semaphore>) {
    loop {
        if shared.paused.load(Ordering::Relaxed) {
            shared.wake.notified().await;
            continue;
        }

        let job = shared.queue.lock().unwrap().pop_front();
        let Some(job) = job else {
            shared.wake.notified().await;
            continue;
        };

        let Ok(permit) = permits.clone().acquire_owned().await else {
            return;
        };

        let Some(pipeline) = shared.pipeline.upgrade() else {
            return;
        };

        let key = image_cache_key(&job.request);
        let shared_for_task = shared.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            debug!(url = job.request.source.url(), destination = ?job.destination, "prefetching");
            if let Err(error) = pipeline.prefetch_one(job.request, job.destination).await {
                debug!(%error, "prefetch attempt failed");
            }
        });
        {
            let mut in_flight = shared_for_task.in_flight.lock().unwrap();
            in_flight.retain(|(_, h)| !h.is_finished());
            in_flight.push((key, handle));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_prefetching_only_drops_matching_requests() {
        let shared = Arc::new(Shared {
            pipeline: Weak::new(),
            queue: Mutex::new(VecDeque::new()),
            paused: AtomicBool::new(true),
            wake: Notify::new(),
            in_flight: Mutex::new(Vec::new()),
        });
        let prefetcher = Prefetcher {
            shared: shared.clone(),
            permits: Arc::new(Semaphore::new(1)),
        };

        let keep = Request::new("https://example.com/keep.jpg");
        let stop = Request::new("https://example.com/stop.jpg");
        prefetcher.start_prefetching(vec![keep.clone(), stop.clone()], PrefetchDestination::DiskCache);
        assert_eq!(prefetcher.queued_count(), 2);

        prefetcher.stop_prefetching(vec![stop]);
        assert_eq!(prefetcher.queued_count(), 1);
        let remaining = shared.queue.lock().unwrap();
        assert_eq!(remaining[0].request.source.url(), keep.source.url());
    }

    #[test]
    fn pause_and_resume_toggle_state() {
        let shared = Arc::new(Shared {
            pipeline: Weak::new(),
            queue: Mutex::new(VecDeque::new()),
            paused: AtomicBool::new(false),
            wake: Notify::new(),
            in_flight: Mutex::new(Vec::new()),
        });
        let prefetcher = Prefetcher {
            shared: shared.clone(),
            permits: Arc::new(Semaphore::new(1)),
        };
        assert!(!prefetcher.is_paused());
        prefetcher.pause();
        assert!(prefetcher.is_paused());
        prefetcher.resume();
        assert!(!prefetcher.is_paused());
    }
}
