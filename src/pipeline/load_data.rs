//! `LoadImageData` task (spec.md §4.5): data-cache lookup, rate-limited
//! fetch, resumable download, progressive data delivery.

use std::sync::Arc;

use tracing::debug;

use crate::error::PipelineError;
use crate::keys::{data_cache_key, load_key, LoadKey};
use crate::loader::PartialData;
use crate::request::Request;
use crate::task::Task;

use super::Pipeline;

/// A delivered byte range. Non-final values carry the bytes accumulated
/// so far (for progressive decode); the final value carries the complete
/// payload.
#[derive(Debug, Clone)]
pub struct DataChunk {
    pub bytes: Arc<Vec<u8>>,
    pub total: Option<u64>,
}

/// Get or create the coalesced `LoadImageData` task for `request`'s
/// `loadKey`. Two requests with the same `loadKey` share one task and
/// therefore one underlying `DataLoader.load` call (spec.md §4.5 contract,
/// §8 invariant 2).
pub fn task_for(pipeline: &Arc<Pipeline>, request: &Request) -> (LoadKey, Arc<Task<DataChunk>>) {
    let key = load_key(request);
    let pipeline_for_run = pipeline.clone();
    let request_for_run = request.clone();
    let task = pipeline.load_data_arena.get_or_create_if(
        key.clone(),
        pipeline.config.is_deduplication_enabled,
        move |task| run(pipeline_for_run, request_for_run, task),
    );
    (key, task)
}

async fn run(pipeline: Arc<Pipeline>, request: Request, task: Arc<Task<DataChunk>>) {
    let data_key = data_cache_key(&request);
    // Correlates every log line this load emits, even across retries and
    // the eventual data-cache writeback, without requiring callers to pass
    // their own request id.
    let trace_id = uuid::Uuid::new_v4();
    debug!(%trace_id, key = %data_key, url = request.source.url(), "starting data load");

    if let Some(data_cache) = &pipeline.data_cache {
        if pipeline.config.data_cache_policy.stores_original()
            && !request.options.reload_ignoring_cached_data
        {
            let _permit = pipeline.queues.data_caching.acquire().await;
            match data_cache.cached_data(data_key.as_str()).await {
                Ok(Some(bytes)) => {
                    debug!(key = %data_key, "data cache hit");
                    let total = Some(bytes.len() as u64);
                    task.emit_value(
                        DataChunk {
                            bytes: Arc::new(bytes),
                            total,
                        },
                        true,
                    );
                    return;
                }
                Ok(None) => {}
                Err(error) => {
                    debug!(key = %data_key, %error, "data cache read failed, falling through to network");
                }
            }
        }
    }

    if request.options.return_cache_data_dont_load {
        task.emit_error(PipelineError::DataLoadingFailed(
            "resourceUnavailable".to_string(),
        ));
        return;
    }

    if pipeline.config.is_rate_limiter_enabled {
        if let Some(limiter) = &pipeline.rate_limiter {
            let gate_task = task.clone();
            let acquired = limiter.acquire(move || gate_task.is_cancelled()).await;
            if !acquired {
                return;
            }
        }
    }

    let _permit = pipeline.queues.data_loading.acquire().await;
    if task.is_cancelled() {
        return;
    }

    let canonical = crate::keys::canonical_url(request.source.url());
    let resume: Option<PartialData> = if pipeline.config.is_resumable_data_enabled {
        pipeline
            .resumable
            .as_ref()
            .and_then(|store| store.take(&canonical))
    } else {
        None
    };

    let progress_task = task.clone();
    let on_progress = move |bytes: &[u8], total: Option<u64>| {
        progress_task.emit_progress(bytes.len() as u64, total);
        progress_task.emit_value(
            DataChunk {
                bytes: Arc::new(bytes.to_vec()),
                total,
            },
            false,
        );
    };

    let cancel_task = task.clone();
    let is_cancelled = move || cancel_task.is_cancelled();

    let resumable_for_failure = pipeline.resumable.clone();
    let canonical_for_failure = canonical.clone();
    let enabled_for_failure = pipeline.config.is_resumable_data_enabled;
    let on_partial_failure = move |partial: PartialData| {
        if enabled_for_failure {
            if let Some(store) = &resumable_for_failure {
                debug!(url = %canonical_for_failure, bytes = partial.bytes.len(), "preserving partial download for resume");
                store.store(canonical_for_failure.clone(), partial);
            }
        }
    };

    let result = pipeline
        .data_loader
        .load(&request, resume, &on_progress, &is_cancelled, &on_partial_failure)
        .await;

    match result {
        Ok(loaded) => {
            if let Some(data_cache) = &pipeline.data_cache {
                if pipeline.config.data_cache_policy.stores_original() {
                    let _permit = pipeline.queues.data_caching.acquire().await;
                    if let Err(error) = data_cache.store_data(data_key.as_str(), &loaded.bytes).await {
                        debug!(key = %data_key, %error, "failed to write original bytes to data cache");
                    }
                }
            }
            // The chunk that completed the body never reached `on_progress`
            // above (it's folded into this terminal emission instead), so
            // report its progress explicitly here rather than losing it.
            task.emit_progress(loaded.bytes.len() as u64, loaded.total_size);
            task.emit_value(
                DataChunk {
                    bytes: Arc::new(loaded.bytes),
                    total: loaded.total_size,
                },
                true,
            );
        }
        Err(PipelineError::Cancelled) => {
            // Cancellation never delivers a terminal event (spec.md §5);
            // resumable preservation already happened via
            // `on_partial_failure` above if the loader offered bytes.
        }
        Err(error) => {
            task.emit_error(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests_support::{FailingDataLoader, InMemoryDataCache, StaticDataLoader};
    use crate::pipeline::PipelineBuilder;
    use crate::request::Priority;
    use crate::task::Event;

    #[tokio::test]
    async fn data_cache_hit_short_circuits_the_network() {
        let data_cache = Arc::new(InMemoryDataCache::new());
        let request = Request::new("https://example.com/a.jpg");
        let key = data_cache_key(&request);
        data_cache.seed(key, b"cached-bytes".to_vec()).await;

        let loader = Arc::new(FailingDataLoader::new("should not be called"));
        let pipeline = PipelineBuilder::new(loader)
            .data_cache(data_cache)
            .build();

        let (_key, task) = task_for(&pipeline, &request);
        let (_sub, mut rx) = task.subscribe(Priority::Normal);
        let event = rx.recv().await.unwrap();
        match event {
            Event::Value { value, is_final } => {
                assert!(is_final);
                assert_eq!(&*value.bytes, b"cached-bytes");
            }
            other => panic!("expected value, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn network_miss_falls_through_to_loader() {
        let loader = Arc::new(StaticDataLoader::new(vec![b"chunk-one".to_vec(), b"chunk-two".to_vec()]));
        let pipeline = PipelineBuilder::new(loader.clone()).build();
        let request = Request::new("https://example.com/b.jpg");

        let (_key, task) = task_for(&pipeline, &request);
        let (_sub, mut rx) = task.subscribe(Priority::Normal);

        let mut saw_final = false;
        while let Some(event) = rx.recv().await {
            if let Event::Value { value, is_final } = event {
                if is_final {
                    assert_eq!(&*value.bytes, b"chunk-onechunk-two");
                    saw_final = true;
                    break;
                }
            }
        }
        assert!(saw_final);
        assert_eq!(loader.call_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_requests_for_the_same_load_key_coalesce() {
        let loader = Arc::new(StaticDataLoader::new(vec![b"data".to_vec()]));
        let pipeline = PipelineBuilder::new(loader.clone()).build();
        let request = Request::new("https://example.com/c.jpg");

        let (_k1, t1) = task_for(&pipeline, &request);
        let (_k2, t2) = task_for(&pipeline, &request);
        assert_eq!(t1.id(), t2.id());

        let (_sub1, mut rx1) = t1.subscribe(Priority::Normal);
        let (_sub2, mut rx2) = t2.subscribe(Priority::Normal);
        while rx1.recv().await.map(|e| !e.is_terminal()).unwrap_or(false) {}
        while rx2.recv().await.map(|e| !e.is_terminal()).unwrap_or(false) {}
        assert_eq!(loader.call_count(), 1);
    }
}
