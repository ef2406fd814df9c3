//! `ProcessImage` task (spec.md §4.7): applies a single [`Processor`],
//! coalesced by `processKey = (upstream-image-identity, processor.key)` so
//! two requests that differ only in later processors share the earlier
//! processing work.

use std::sync::Arc;

use crate::container::ImageContainer;
use crate::error::{PipelineError, Result};
use crate::keys::ProcessKey;
use crate::request::{Priority, ProcessorRef};
use crate::task::{Event, Task};

use super::queues::run_blocking_on;
use super::Pipeline;

/// Identity of a decoded container for coalescing purposes: the address
/// of its shared bitmap handle. Two `ImageContainer` values produced by
/// the same coalesced `DecodeImage` emission carry clones of the *same*
/// `Arc<DynamicImage>`, so their pointer is stable and cheap — standing in
/// for spec.md's "source-content-hash-or-cache-key" without re-hashing
/// potentially large pixel buffers on every processor application.
fn identity_of(container: &ImageContainer) -> String {
    format!("{:p}", Arc::as_ptr(&container.image))
}

/// Apply `processor` to `container`, coalescing with any other in-flight
/// application of the same processor to the same input image. Animated
/// and vector containers bypass processing entirely and are forwarded
/// unchanged, per spec.md §4.7.
pub async fn apply(
    pipeline: &Arc<Pipeline>,
    container: &ImageContainer,
    processor: ProcessorRef,
) -> Result<Option<ImageContainer>> {
    if container.image_type.bypasses_processing() {
        return Ok(Some(container.clone()));
    }

    let identity = identity_of(container);
    let process_key = ProcessKey::new(&identity, processor.identifier(), &processor.key());

    let pipeline_for_run = pipeline.clone();
    let container_for_run = container.clone();
    let processor_for_run = processor.clone();
    let task = pipeline.process_arena.get_or_create_if(
        process_key,
        pipeline.config.is_deduplication_enabled,
        move |task| run(pipeline_for_run, container_for_run, processor_for_run, task),
    );

    let (_sub, mut rx) = task.subscribe(Priority::Normal);
    while let Some(event) = rx.recv().await {
        match event {
            Event::Value { value, .. } => return Ok(Some(value)),
            Event::Error(PipelineError::ProcessingFailed(_)) => return Ok(None),
            Event::Error(e) => return Err(e),
            Event::Progress { .. } => continue,
        }
    }
    Ok(None)
}

async fn run(
    pipeline: Arc<Pipeline>,
    container: ImageContainer,
    processor: ProcessorRef,
    task: Arc<Task<ImageContainer>>,
) {
    let identifier = processor.identifier().to_string();
    let stage = pipeline.queues.processing.clone();
    let result = run_blocking_on(&stage, move || processor.process(&container)).await;
    match result {
        Ok(Some(output)) => task.emit_value(output, true),
        Ok(None) => task.emit_error(PipelineError::ProcessingFailed(identifier)),
        Err(e) => task.emit_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ImageType;
    use crate::pipeline::tests_support::StaticDataLoader;
    use crate::pipeline::PipelineBuilder;
    use crate::processing::ResizeProcessor;
    use image::DynamicImage;

    #[tokio::test]
    async fn applies_a_processor_and_coalesces_identical_requests() {
        let pipeline = PipelineBuilder::new(Arc::new(StaticDataLoader::new(vec![]))).build();
        let container = ImageContainer::final_(DynamicImage::new_rgb8(400, 200), ImageType::Jpeg);
        let processor: ProcessorRef = Arc::new(ResizeProcessor::new(100, 100));

        let a = apply(&pipeline, &container, processor.clone()).await.unwrap().unwrap();
        assert!(a.image.width() <= 100 && a.image.height() <= 100);

        let b = apply(&pipeline, &container, processor).await.unwrap().unwrap();
        assert_eq!((b.image.width(), b.image.height()), (a.image.width(), a.image.height()));
    }

    #[tokio::test]
    async fn animated_containers_bypass_the_processor() {
        let pipeline = PipelineBuilder::new(Arc::new(StaticDataLoader::new(vec![]))).build();
        let container =
            ImageContainer::final_(DynamicImage::new_rgb8(400, 200), ImageType::AnimatedGif);
        let processor: ProcessorRef = Arc::new(ResizeProcessor::new(100, 100));
        let out = apply(&pipeline, &container, processor).await.unwrap().unwrap();
        assert_eq!((out.image.width(), out.image.height()), (400, 200));
    }
}
