//! Default `Processor` implementations. The `Processor` trait itself lives
//! in [`crate::request`] since it's part of the request shape; this module
//! holds concrete, ready-to-use processors.
//!
//! Grounded in `process_image_sync`'s `img.thumbnail(target_width,
//! target_height)` resize step in
//! `ferrex-player/src/domains/metadata/image_pipeline/processor.rs`.

use image::imageops::FilterType;

use crate::container::ImageContainer;
use crate::error::Result;
use crate::request::Processor;

/// Resizes to fit within `width` x `height`, preserving aspect ratio.
/// Declines (returns `Ok(None)`) for animated/vector containers, which
/// bypass processing entirely (spec.md §4.7).
#[derive(Debug, Clone, Copy)]
pub struct ResizeProcessor {
    pub width: u32,
    pub height: u32,
    pub filter: ResizeFilter,
}

/// Subset of `image::imageops::FilterType` exposed here so callers don't
/// need to depend on the `image` crate directly just to pick a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeFilter {
    Nearest,
    Triangle,
    Lanczos3,
}

impl From<ResizeFilter> for FilterType {
    fn from(value: ResizeFilter) -> Self {
        match value {
            ResizeFilter::Nearest => FilterType::Nearest,
            ResizeFilter::Triangle => FilterType::Triangle,
            ResizeFilter::Lanczos3 => FilterType::Lanczos3,
        }
    }
}

impl ResizeProcessor {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            filter: ResizeFilter::Triangle,
        }
    }

    pub fn with_filter(mut self, filter: ResizeFilter) -> Self {
        self.filter = filter;
        self
    }
}

impl Processor for ResizeProcessor {
    fn identifier(&self) -> &str {
        "resize"
    }

    fn key(&self) -> String {
        format!("{}x{}:{:?}", self.width, self.height, self.filter)
    }

    fn process(&self, input: &ImageContainer) -> Result<Option<ImageContainer>> {
        if input.image_type.bypasses_processing() {
            return Ok(None);
        }
        let resized = if input.image.width() > self.width || input.image.height() > self.height {
            input
                .image
                .resize(self.width, self.height, self.filter.into())
        } else {
            (*input.image).clone()
        };
        let mut out = ImageContainer::new(resized, input.image_type, input.is_preview);
        out.user_info = input.user_info.clone();
        Ok(Some(out))
    }
}

/// Produces a small, heavily-compressed preview ("low quality image
/// placeholder") from a larger decoded image. Grounded in
/// `generate_lqip`'s `image.thumbnail(20, 20)` + low-quality JPEG step.
#[derive(Debug, Clone, Copy)]
pub struct ThumbnailProcessor {
    pub width: u32,
    pub height: u32,
}

impl ThumbnailProcessor {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Processor for ThumbnailProcessor {
    fn identifier(&self) -> &str {
        "thumbnail"
    }

    fn key(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }

    fn process(&self, input: &ImageContainer) -> Result<Option<ImageContainer>> {
        if input.image_type.bypasses_processing() {
            return Ok(None);
        }
        let thumb = input.image.thumbnail(self.width, self.height);
        let mut out = ImageContainer::new(thumb, input.image_type, input.is_preview);
        out.user_info = input.user_info.clone();
        Ok(Some(out))
    }
}
