//! The pipeline's unit of image payload, and the response envelope wrapping
//! it for delivery to a caller.

use std::collections::BTreeMap;
use std::sync::Arc;

use image::DynamicImage;

/// Detected image container format. Distinguishing animated/vector from
/// static lets `ProcessImage`/`Decompress` bypass work that doesn't apply
/// to them (spec.md §4.7/§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageType {
    Png,
    Jpeg,
    Gif,
    WebP,
    Bmp,
    AnimatedGif,
    AnimatedWebP,
    Svg,
    Unknown,
}

impl ImageType {
    pub fn is_animated(&self) -> bool {
        matches!(self, ImageType::AnimatedGif | ImageType::AnimatedWebP)
    }

    pub fn is_vector(&self) -> bool {
        matches!(self, ImageType::Svg)
    }

    /// Animated/vector containers bypass `Processor`/`Decompress` — their
    /// original bytes (not the decoded bitmap) are the thing that matters.
    pub fn bypasses_processing(&self) -> bool {
        self.is_animated() || self.is_vector()
    }

    pub fn sniff(bytes: &[u8]) -> ImageType {
        if bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
            ImageType::Png
        } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            ImageType::Jpeg
        } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
            if gif_is_animated(bytes) {
                ImageType::AnimatedGif
            } else {
                ImageType::Gif
            }
        } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            ImageType::WebP
        } else if bytes.starts_with(&[0x42, 0x4D]) {
            ImageType::Bmp
        } else if bytes.starts_with(b"<?xml") || bytes.starts_with(b"<svg") {
            ImageType::Svg
        } else {
            ImageType::Unknown
        }
    }
}

/// Cheap heuristic: a GIF has more than one Image Descriptor block (0x2C).
/// Good enough to route bypass decisions; not a full GIF parser.
fn gif_is_animated(bytes: &[u8]) -> bool {
    bytes.iter().filter(|&&b| b == 0x2C).count() > 1
}

/// The decoded, possibly-processed image payload the pipeline produces.
#[derive(Debug, Clone)]
pub struct ImageContainer {
    /// Opaque bitmap handle. The real pipeline would hand out a
    /// platform-specific bitmap type (CGImage/Bitmap/etc.) via the
    /// `Decoder`/UI-binding boundary; this core stands in with the
    /// `image` crate's in-memory representation, since concrete bitmap
    /// types are explicitly out of scope (spec.md §1).
    pub image: Arc<DynamicImage>,

    /// Original bytes, retained verbatim for formats the core must hand
    /// off rather than re-encode (animated, vector).
    pub data: Option<Arc<Vec<u8>>>,

    pub image_type: ImageType,

    /// True for intermediate progressive frames.
    pub is_preview: bool,

    pub user_info: BTreeMap<String, String>,
}

impl ImageContainer {
    pub fn new(image: DynamicImage, image_type: ImageType, is_preview: bool) -> Self {
        Self {
            image: Arc::new(image),
            data: None,
            image_type,
            is_preview,
            user_info: BTreeMap::new(),
        }
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = Some(Arc::new(data));
        self
    }

    pub fn with_user_info(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_info.insert(key.into(), value.into());
        self
    }

    pub fn final_(image: DynamicImage, image_type: ImageType) -> Self {
        Self::new(image, image_type, false)
    }

    pub fn preview(image: DynamicImage, image_type: ImageType) -> Self {
        Self::new(image, image_type, true)
    }

    /// Rough byte footprint used as `MemoryCache` cost: width * height *
    /// bytes-per-pixel, matching spec.md §4.10.
    pub fn cost(&self) -> u64 {
        let (w, h) = (self.image.width() as u64, self.image.height() as u64);
        w * h * 4
    }
}

/// Where a delivered `ImageResponse` came from, for UI/metrics purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheType {
    Memory,
    Disk,
    None,
}

/// `ImageContainer` plus delivery metadata.
#[derive(Debug, Clone)]
pub struct ImageResponse {
    pub container: ImageContainer,
    pub cache_type: CacheType,
}

impl ImageResponse {
    pub fn new(container: ImageContainer, cache_type: CacheType) -> Self {
        Self {
            container,
            cache_type,
        }
    }
}
