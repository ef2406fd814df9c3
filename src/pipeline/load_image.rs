//! `LoadImage` task (spec.md §4.4): the top-level coordinator —
//! processed-cache lookup, intermediate-cache walk, full load through
//! `DecodeImage`/`ProcessImage`, `Decompress`, then writeback.
//!
//! The spec's recursive `LoadImage(request without last processor)`
//! sub-task is flattened here into one coordinator that drives
//! `DecodeImage` directly for the base (processor-free) image and then
//! applies `ProcessImage` stages in order; `DecodeImage`/`LoadImageData`
//! are already coalesced by `loadKey` and `ProcessImage` by `processKey`,
//! so the externally observable coalescing behavior spec.md §8 requires
//! is unchanged. Recorded as a deliberate simplification in DESIGN.md.

use std::sync::Arc;

use tracing::debug;

use crate::container::{CacheType, ImageContainer, ImageResponse};
use crate::error::PipelineError;
use crate::keys::{image_cache_key, ImageCacheKey};
use crate::request::{Priority, Request};
use crate::task::backpressure::SingleSlot;
use crate::task::{Event, Task};

use super::{decode, process};
use super::Pipeline;

pub fn task_for(pipeline: &Arc<Pipeline>, request: &Request) -> (ImageCacheKey, Arc<Task<ImageResponse>>) {
    let key = image_cache_key(request);
    let pipeline_for_run = pipeline.clone();
    let request_for_run = request.clone();
    let task = pipeline.load_image_arena.get_or_create_if(
        key.clone(),
        pipeline.config.is_deduplication_enabled,
        move |task| run(pipeline_for_run, request_for_run, task),
    );
    (key, task)
}

async fn run(pipeline: Arc<Pipeline>, request: Request, task: Arc<Task<ImageResponse>>) {
    let image_key = image_cache_key(&request);

    // 1. Memory cache fast path. `reloadIgnoringCachedData` bypasses this
    // the same way it bypasses the disk-cache path in step 2 below — the
    // flag means "ignore caches", not just "ignore the disk cache"
    // (spec.md §8 scenario S6).
    if !request.options.disable_memory_cache_reads && !request.options.reload_ignoring_cached_data {
        if let Some(cached) = pipeline.memory_cache.get(&image_key).await {
            if !cached.container.is_preview {
                debug!(key = %image_key, "memory cache hit (final)");
                task.emit_value(
                    ImageResponse::new(cached.container.clone(), CacheType::Memory),
                    true,
                );
                return;
            }
            debug!(key = %image_key, "memory cache hit (preview), continuing load");
            task.emit_value(
                ImageResponse::new(cached.container.clone(), CacheType::Memory),
                false,
            );
        }
    }

    // 2. Processed disk-cache path.
    if let Some(data_cache) = pipeline.data_cache.clone() {
        if pipeline.config.data_cache_policy.stores_encoded()
            && !request.options.reload_ignoring_cached_data
            && !request.options.disable_disk_cache_reads
        {
            let hit = {
                let _permit = pipeline.queues.data_caching.acquire().await;
                data_cache.cached_data(image_key.as_str()).await
            };
            if let Ok(Some(bytes)) = hit {
                if let Some(container) = decode_complete_bytes(&pipeline, &bytes) {
                    let container = super::decompress::run(&pipeline, container).await;
                    writeback(&pipeline, &request, &image_key, &container, true).await;
                    debug!(key = %image_key, "processed disk cache hit");
                    task.emit_value(ImageResponse::new(container, CacheType::Disk), true);
                    return;
                }
            }
        }
    }

    // 3. Intermediate cache walk: probe decreasing processor prefixes for
    // a non-preview memory-cache hit, then apply the remaining suffix.
    if !request.options.disable_memory_cache_reads && !request.options.reload_ignoring_cached_data {
        for i in (0..request.processors.len()).rev() {
            let prefix_request = request.with_processors_prefix(i);
            let prefix_key = image_cache_key(&prefix_request);
            let Some(cached) = pipeline.memory_cache.get(&prefix_key).await else {
                continue;
            };
            if cached.container.is_preview {
                continue;
            }

            let mut container = cached.container.clone();
            let mut declined = false;
            for processor in &request.processors[i..] {
                match process::apply(&pipeline, &container, processor.clone()).await {
                    Ok(Some(next)) => container = next,
                    Ok(None) | Err(_) => {
                        declined = true;
                        break;
                    }
                }
            }
            if declined {
                continue;
            }

            let container = super::decompress::run(&pipeline, container).await;
            writeback(&pipeline, &request, &image_key, &container, true).await;
            debug!(key = %image_key, from = %prefix_key, "intermediate cache hit");
            task.emit_value(ImageResponse::new(container, CacheType::Memory), true);
            return;
        }
    }

    // 4. `returnCacheDataDontLoad` guard.
    if request.options.return_cache_data_dont_load {
        task.emit_error(PipelineError::DataLoadingFailed(
            "resourceUnavailable".to_string(),
        ));
        return;
    }

    // 5. Full load: decode the unprocessed image, then apply processors
    // left-to-right on every delivered value (previews included).
    let base_request = request.without_processors();
    let (_load_key, decode_task) = decode::task_for(&pipeline, &base_request);
    let priority = task.aggregated_priority().max(Priority::Low);
    let (decode_sub, mut decode_rx) = decode_task.subscribe(priority);
    task.register_dependency(Arc::new(decode_sub));

    // `ProcessImage`/`Decompress` dispatch for this task goes through the
    // same single-in-flight, newest-pending-wins slot `DecodeImage` uses
    // for decode dispatch (spec.md §4.7/§4.8, invariant 5): a preview
    // that's still being processed when a fresher one arrives is dropped
    // in favor of the fresher one instead of queuing both.
    let slot: SingleSlot<(ImageContainer, bool)> = SingleSlot::new();

    while let Some(event) = decode_rx.recv().await {
        if task.is_cancelled() {
            return;
        }
        match event {
            Event::Progress { completed, total } => task.emit_progress(completed, total),
            Event::Error(error) => {
                task.emit_error(error);
                return;
            }
            Event::Value { value, is_final } => {
                let pipeline_for_work = pipeline.clone();
                let request_for_work = request.clone();
                let task_for_work = task.clone();
                let image_key_for_work = image_key.clone();
                slot.submit((value, is_final), move |(value, is_final)| {
                    let pipeline = pipeline_for_work.clone();
                    let request = request_for_work.clone();
                    let task = task_for_work.clone();
                    let image_key = image_key_for_work.clone();
                    async move {
                        process_and_emit(pipeline, request, task, image_key, value, is_final).await;
                    }
                });
                if is_final {
                    break;
                }
            }
        }
    }
}

/// Runs the `ProcessImage`/`Decompress`/writeback chain for one decoded
/// value and emits the result on `task`. Dispatched through a
/// [`SingleSlot`] from `run`'s loop above, so it's never running more than
/// once concurrently for a given `LoadImage` task.
async fn process_and_emit(
    pipeline: Arc<Pipeline>,
    request: Request,
    task: Arc<Task<ImageResponse>>,
    image_key: ImageCacheKey,
    value: ImageContainer,
    is_final: bool,
) {
    if task.is_cancelled() {
        return;
    }

    let mut current = value;
    let mut declined_processor = None;
    for processor in &request.processors {
        match process::apply(&pipeline, &current, processor.clone()).await {
            Ok(Some(next)) => current = next,
            Ok(None) => {
                declined_processor = Some(processor.identifier().to_string());
                break;
            }
            Err(_) => {
                declined_processor = Some(processor.identifier().to_string());
                break;
            }
        }
    }

    if let Some(identifier) = declined_processor {
        if is_final {
            task.emit_error(PipelineError::ProcessingFailed(identifier));
        }
        // Preview processing failures are dropped silently (spec.md §4.7)
        // — wait for the next delivered value.
        return;
    }

    let current = super::decompress::run(&pipeline, current).await;
    writeback(&pipeline, &request, &image_key, &current, is_final).await;
    task.emit_value(ImageResponse::new(current, CacheType::None), is_final);
}

pub(super) fn decode_complete_bytes(pipeline: &Arc<Pipeline>, bytes: &[u8]) -> Option<ImageContainer> {
    let image_type = crate::container::ImageType::sniff(bytes);
    let decoder = pipeline.decoder_registry.decoder_for(bytes);
    decoder
        .decode(bytes, image_type)
        .ok()
        .map(|image| ImageContainer::final_(image, image_type).with_data(bytes.to_vec()))
}

/// Step 6 of spec.md §4.4: on every delivered value, write to the memory
/// cache (respecting the preview-storage toggle); on the final value,
/// optionally re-encode and write to the data cache.
async fn writeback(
    pipeline: &Arc<Pipeline>,
    request: &Request,
    image_key: &ImageCacheKey,
    container: &ImageContainer,
    is_final: bool,
) {
    if !request.options.disable_memory_cache_writes
        && (!container.is_preview || pipeline.config.is_storing_previews_in_memory_cache)
    {
        pipeline
            .memory_cache
            .insert(
                image_key.clone(),
                Arc::new(ImageResponse::new(container.clone(), CacheType::None)),
            )
            .await;
    }

    if !is_final || request.options.disable_disk_cache_writes {
        return;
    }

    let Some(data_cache) = pipeline.data_cache.clone() else {
        return;
    };
    if !pipeline.config.data_cache_policy.stores_encoded() || request.processors.is_empty() {
        return;
    }
    if !has_cacheable_url(request) {
        // Opaque-scheme sources skip disk-caching of encoded finals
        // (spec.md §4.4 edge case).
        return;
    }

    let encoder = pipeline.encoder.clone();
    let image = container.image.clone();
    let image_type = container.image_type;
    let stage = pipeline.queues.encoding.clone();
    let encoded = super::queues::run_blocking_on(&stage, move || encoder.encode(&image, image_type)).await;
    match encoded {
        Ok(bytes) => {
            let _permit = pipeline.queues.data_caching.acquire().await;
            if let Err(error) = data_cache.store_data(image_key.as_str(), &bytes).await {
                debug!(key = %image_key, %error, "failed to write processed image to data cache");
            }
        }
        Err(error) => debug!(key = %image_key, %error, "failed to encode processed image for writeback"),
    }
}

fn has_cacheable_url(request: &Request) -> bool {
    url::Url::parse(request.source.url()).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests_support::StaticDataLoader;
    use crate::pipeline::PipelineBuilder;
    use crate::processing::ResizeProcessor;
    use crate::request::ProcessorRef;
    use image::{DynamicImage, ImageFormat};
    use std::io::Cursor;

    fn sample_png_bytes(w: u32, h: u32) -> Vec<u8> {
        let image = DynamicImage::new_rgba8(w, h);
        let mut buffer = Vec::new();
        image.write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png).unwrap();
        buffer
    }

    #[tokio::test]
    async fn full_load_decodes_and_processes() {
        let bytes = sample_png_bytes(400, 400);
        let loader = Arc::new(StaticDataLoader::new(vec![bytes]));
        let pipeline = PipelineBuilder::new(loader).build();
        let processor: ProcessorRef = Arc::new(ResizeProcessor::new(100, 100));
        let request = Request::new("https://example.com/poster.png").with_processor(processor);

        let (_key, task) = task_for(&pipeline, &request);
        let (_sub, mut rx) = task.subscribe(Priority::Normal);

        let mut final_response = None;
        while let Some(event) = rx.recv().await {
            if let Event::Value { value, is_final: true } = event {
                final_response = Some(value);
                break;
            }
        }
        let response = final_response.expect("expected a final response");
        assert!(response.container.image.width() <= 100);
        assert!(response.container.image.height() <= 100);
    }

    #[tokio::test]
    async fn memory_cache_hit_short_circuits_the_loader() {
        use crate::container::ImageType;

        let loader = Arc::new(StaticDataLoader::new(vec![]));
        let pipeline = PipelineBuilder::new(loader.clone()).build();
        let request = Request::new("https://example.com/cached.png");
        let key = image_cache_key(&request);

        let cached = ImageContainer::final_(DynamicImage::new_rgb8(10, 10), ImageType::Png);
        pipeline
            .memory_cache
            .insert(
                key,
                Arc::new(ImageResponse::new(cached, CacheType::Memory)),
            )
            .await;

        let (_key, task) = task_for(&pipeline, &request);
        let (_sub, mut rx) = task.subscribe(Priority::Normal);
        let event = rx.recv().await.unwrap();
        match event {
            Event::Value { value, is_final } => {
                assert!(is_final);
                assert_eq!(value.cache_type, CacheType::Memory);
            }
            other => panic!("expected value, got {other:?}"),
        }
        assert_eq!(loader.call_count(), 0);
    }
}
