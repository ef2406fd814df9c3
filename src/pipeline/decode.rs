//! `DecodeImage` task (spec.md §4.6): streaming decode with progressive
//! previews, coalesced by `loadKey` just like its `LoadImageData`
//! dependency.

use std::sync::{Arc, Mutex};

use crate::container::{ImageContainer, ImageType};
use crate::decoder::Decoder;
use crate::keys::{load_key, LoadKey};
use crate::request::Request;
use crate::task::backpressure::SingleSlot;
use crate::task::{Event, Task};

use super::load_data;
use super::Pipeline;

pub fn task_for(pipeline: &Arc<Pipeline>, request: &Request) -> (LoadKey, Arc<Task<ImageContainer>>) {
    let key = load_key(request);
    let pipeline_for_run = pipeline.clone();
    let request_for_run = request.clone();
    let task = pipeline.decode_arena.get_or_create_if(
        key.clone(),
        pipeline.config.is_deduplication_enabled,
        move |task| run(pipeline_for_run, request_for_run, task),
    );
    (key, task)
}

async fn run(pipeline: Arc<Pipeline>, request: Request, task: Arc<Task<ImageContainer>>) {
    let (_load_key, data_task) = load_data::task_for(&pipeline, &request);
    let priority = task.aggregated_priority();
    let (data_sub, mut data_rx) = data_task.subscribe(priority);
    task.register_dependency(Arc::new(data_sub));

    let slot: SingleSlot<(Arc<Vec<u8>>, bool)> = SingleSlot::new();
    let decoder_cell: Arc<Mutex<Option<Arc<dyn Decoder>>>> = Arc::new(Mutex::new(None));

    while let Some(event) = data_rx.recv().await {
        match event {
            Event::Progress { completed, total } => task.emit_progress(completed, total),
            Event::Error(error) => {
                task.emit_error(error);
                return;
            }
            Event::Value { value, is_final } => {
                if task.is_cancelled() {
                    return;
                }
                if !is_final && !pipeline.config.is_progressive_decoding_enabled {
                    continue;
                }
                let pipeline_for_decode = pipeline.clone();
                let task_for_decode = task.clone();
                let decoder_cell_for_decode = decoder_cell.clone();
                slot.submit((value.bytes, is_final), move |(bytes, is_final)| {
                    let pipeline = pipeline_for_decode.clone();
                    let task = task_for_decode.clone();
                    let decoder_cell = decoder_cell_for_decode.clone();
                    async move {
                        decode_one(pipeline, task, decoder_cell, bytes, is_final).await;
                    }
                });
                if is_final {
                    break;
                }
            }
        }
    }
}

async fn decode_one(
    pipeline: Arc<Pipeline>,
    task: Arc<Task<ImageContainer>>,
    decoder_cell: Arc<Mutex<Option<Arc<dyn Decoder>>>>,
    bytes: Arc<Vec<u8>>,
    is_final: bool,
) {
    if task.is_cancelled() {
        return;
    }

    let image_type = ImageType::sniff(&bytes);
    let decoder = {
        let mut cell = decoder_cell.lock().unwrap();
        if cell.is_none() {
            *cell = Some(pipeline.decoder_registry.decoder_for(&bytes));
        }
        cell.clone().unwrap()
    };

    let stage = pipeline.queues.decoding.clone();
    if is_final {
        let bytes_for_blocking = bytes.clone();
        let decoder_for_blocking = decoder;
        let result = super::queues::run_blocking_on(&stage, move || {
            decoder_for_blocking.decode(&bytes_for_blocking, image_type)
        })
        .await;
        match result {
            Ok(image) => {
                let container =
                    ImageContainer::final_(image, image_type).with_data((*bytes).clone());
                task.emit_value(container, true);
            }
            Err(error) => task.emit_error(error),
        }
    } else {
        let bytes_for_blocking = bytes;
        let decoder_for_blocking = decoder;
        let result = super::queues::run_blocking_on(&stage, move || {
            decoder_for_blocking.decode_partial(&bytes_for_blocking, image_type)
        })
        .await;
        match result {
            Ok(Some(image)) => {
                let container = ImageContainer::preview(image, image_type);
                task.emit_value(container, false);
            }
            // Not enough data yet, or a transient partial-decode failure:
            // both are dropped silently per spec.md §7 — the pipeline
            // waits for more bytes rather than failing the whole load.
            Ok(None) | Err(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests_support::StaticDataLoader;
    use crate::pipeline::PipelineBuilder;
    use crate::request::Priority;
    use image::{DynamicImage, ImageFormat};
    use std::io::Cursor;

    fn sample_png_bytes(w: u32, h: u32) -> Vec<u8> {
        let image = DynamicImage::new_rgba8(w, h);
        let mut buffer = Vec::new();
        image.write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png).unwrap();
        buffer
    }

    #[tokio::test]
    async fn decodes_a_single_chunk_final_response() {
        let bytes = sample_png_bytes(2, 2);
        let loader = Arc::new(StaticDataLoader::new(vec![bytes]));
        let pipeline = PipelineBuilder::new(loader).build();
        let request = Request::new("https://example.com/a.png");

        let (_key, task) = task_for(&pipeline, &request);
        let (_sub, mut rx) = task.subscribe(Priority::Normal);

        let mut final_image = None;
        while let Some(event) = rx.recv().await {
            if let Event::Value { value, is_final: true } = event {
                final_image = Some(value);
                break;
            }
        }
        let container = final_image.expect("expected a final decoded container");
        assert_eq!((container.image.width(), container.image.height()), (2, 2));
    }
}
