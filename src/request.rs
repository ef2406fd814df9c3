//! Request data model: the immutable description of "what image, processed
//! how, loaded under what rules" that a caller hands to [`crate::Pipeline`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::container::ImageContainer;
use crate::error::Result;

/// Where the bytes come from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Source {
    Url(String),
    /// An opaque, already-built request (method/headers/cache flags) for
    /// callers that need more control than a bare URL.
    UrlRequest {
        url: String,
        headers: BTreeMap<String, String>,
    },
}

impl Source {
    pub fn url(&self) -> &str {
        match self {
            Source::Url(u) => u,
            Source::UrlRequest { url, .. } => url,
        }
    }

    pub fn headers(&self) -> BTreeMap<String, String> {
        match self {
            Source::Url(_) => BTreeMap::new(),
            Source::UrlRequest { headers, .. } => headers.clone(),
        }
    }
}

/// Loading/caching option flags. Named after the checkboxes they represent
/// rather than a single opaque bitset, matching `ImageRequest`-style option
/// structs elsewhere in the corpus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RequestOptions {
    pub reload_ignoring_cached_data: bool,
    pub return_cache_data_dont_load: bool,
    pub disable_memory_cache_reads: bool,
    pub disable_memory_cache_writes: bool,
    pub disable_disk_cache_reads: bool,
    pub disable_disk_cache_writes: bool,
}

/// Request priority. Ordered low to high so `max()` over subscribers gives
/// the aggregated priority directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    VeryLow,
    Low,
    #[default]
    Normal,
    High,
    VeryHigh,
}

/// A deterministic, pure transformation over image containers.
///
/// Identity is the pair `(identifier, key)`: two processors with the same
/// `identifier` but different `key` (e.g. different target size) are
/// different processors for coalescing purposes.
pub trait Processor: Send + Sync + fmt::Debug {
    /// Stable string identifying the processor's kind, e.g. `"resize"`.
    fn identifier(&self) -> &str;

    /// Content-hashable key distinguishing this processor's configuration
    /// from another instance of the same kind (e.g. target dimensions).
    fn key(&self) -> String;

    /// Apply the transformation. `Ok(None)` means "decline to process" —
    /// the caller treats this the same as spec.md's "processor returns
    /// null": terminal failure on a final pass, silent drop on a preview.
    fn process(&self, input: &ImageContainer) -> Result<Option<ImageContainer>>;
}

pub type ProcessorRef = Arc<dyn Processor>;

/// An immutable request for one logical image load.
///
/// Equality — per spec.md §3 — is defined by
/// `(imageCacheKey, dataCacheKey, loadKey, processors-identifier-sequence, options)`.
/// Priority is deliberately excluded: it can change without affecting
/// whether two requests coalesce.
#[derive(Clone)]
pub struct Request {
    pub source: Source,
    pub processors: Vec<ProcessorRef>,
    pub options: RequestOptions,
    pub priority: Priority,
    pub user_info: BTreeMap<String, String>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("source", &self.source)
            .field(
                "processors",
                &self
                    .processors
                    .iter()
                    .map(|p| p.identifier())
                    .collect::<Vec<_>>(),
            )
            .field("options", &self.options)
            .field("priority", &self.priority)
            .finish()
    }
}

impl Request {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            source: Source::Url(url.into()),
            processors: Vec::new(),
            options: RequestOptions::default(),
            priority: Priority::default(),
            user_info: BTreeMap::new(),
        }
    }

    pub fn with_processor(mut self, processor: ProcessorRef) -> Self {
        self.processors.push(processor);
        self
    }

    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_user_info(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_info.insert(key.into(), value.into());
        self
    }

    /// `imageId` override: replaces the URL component of cache-key
    /// derivation verbatim when present.
    pub fn image_id(&self) -> Option<&str> {
        self.user_info.get("imageId").map(String::as_str)
    }

    /// A request with only the first `n` processors applied.
    pub fn with_processors_prefix(&self, n: usize) -> Request {
        Request {
            source: self.source.clone(),
            processors: self.processors[..n.min(self.processors.len())].to_vec(),
            options: self.options,
            priority: self.priority,
            user_info: self.user_info.clone(),
        }
    }

    /// Request reduced to just the original image (no processors), used to
    /// recurse into the data/decode chain.
    pub fn without_processors(&self) -> Request {
        self.with_processors_prefix(0)
    }
}
