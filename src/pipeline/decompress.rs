//! `Decompress` stage (spec.md §4.8): forces bitmap realization off the
//! caller's thread. Callers that stream multiple values per task (the
//! `LoadImage` full-load loop) dispatch into this through the same
//! single-in-flight `SingleSlot` discipline `DecodeImage` uses; one-shot
//! callers (cache-hit paths) call it directly since there's nothing to
//! supersede.
//!
//! The `image` crate (this core's only bundled `Decoder`) never produces
//! lazily-decoded bitmaps — every `DynamicImage` is fully materialized
//! pixel data the moment `decode`/`decode_partial` returns. So unlike the
//! source platform (which defers `CGImage`/`Bitmap` rasterization), this
//! stage has nothing to force here; it is kept as a real, queue-gated
//! pipeline step (rather than deleted) so a caller who plugs in a
//! `Decoder` with genuinely lazy output still gets the off-thread
//! realization spec.md §4.8 requires. Documented as a simplification in
//! DESIGN.md.

use std::sync::Arc;

use crate::container::ImageContainer;

use super::queues::run_blocking_on;
use super::Pipeline;

pub async fn run(pipeline: &Arc<Pipeline>, container: ImageContainer) -> ImageContainer {
    if !pipeline.config.is_decompression_enabled || container.image_type.bypasses_processing() {
        return container;
    }

    let stage = pipeline.queues.decompressing.clone();
    let result = run_blocking_on(&stage, move || -> crate::error::Result<ImageContainer> {
        // Touch the bitmap's dimensions off the async executor, standing
        // in for "draw into a new bitmap context sized to the image's
        // natural dimensions" (spec.md §4.8) since there's no lazy decode
        // to force in this core's default `Decoder`.
        let _ = (container.image.width(), container.image.height());
        Ok(container)
    })
    .await;

    result.expect("decompress stage never fails")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ImageType;
    use crate::pipeline::tests_support::StaticDataLoader;
    use crate::pipeline::PipelineBuilder;
    use image::DynamicImage;

    #[tokio::test]
    async fn passes_through_static_images_unchanged() {
        let pipeline = PipelineBuilder::new(Arc::new(StaticDataLoader::new(vec![]))).build();
        let container = ImageContainer::final_(DynamicImage::new_rgb8(4, 4), ImageType::Png);
        let out = run(&pipeline, container).await;
        assert_eq!((out.image.width(), out.image.height()), (4, 4));
    }

    #[tokio::test]
    async fn skips_animated_containers() {
        let pipeline = PipelineBuilder::new(Arc::new(StaticDataLoader::new(vec![]))).build();
        let container = ImageContainer::final_(DynamicImage::new_rgb8(4, 4), ImageType::AnimatedGif);
        let out = run(&pipeline, container).await;
        assert_eq!((out.image.width(), out.image.height()), (4, 4));
    }
}
