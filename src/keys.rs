//! Cache-key and coalescing-key derivation.
//!
//! Grounded in `ferrex-core/src/infra/cache/image_store.rs::image_cache_key_for`:
//! a stable, versioned, human-readable string built by concatenation rather
//! than a numeric hash, so keys are debuggable and filesystem-safe.

use std::collections::BTreeSet;
use std::fmt;

use sha2::{Digest, Sha256};
use url::Url;

use crate::request::Request;

/// Headers that participate in `loadKey` derivation: per spec.md §9(c), at
/// minimum the ones a `DataLoader` built on HTTP semantics honors when
/// deciding what bytes to return.
const LOAD_KEY_HEADERS: &[&str] = &["range", "if-range", "accept", "accept-encoding"];

/// Deduplication key for the data-loading subtask (`LoadImageData`/
/// `DecodeImage`). Equal for two requests that would fetch the same bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct LoadKey(String);

impl fmt::Display for LoadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl LoadKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Stable, filesystem-safe identifier for the original bytes of an image,
/// independent of any processing applied afterward.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct DataCacheKey(String);

impl fmt::Display for DataCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl DataCacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Identifier for a fully processed image: `dataCacheKey + processor chain`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct ImageCacheKey(String);

impl fmt::Display for ImageCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl ImageCacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Coalescing key for a single processor application:
/// `(upstream-image-identity, processor.key)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct ProcessKey(String);

impl fmt::Display for ProcessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl ProcessKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn new(upstream_identity: &str, processor_identifier: &str, processor_key: &str) -> Self {
        ProcessKey(format!(
            "process/v1/{upstream_identity}|{processor_identifier}:{processor_key}"
        ))
    }
}

/// Canonicalize a URL the way spec.md §6 requires: lowercase scheme/host,
/// strip the default port for the scheme, normalize percent-encoding via
/// `url::Url`'s own parser, drop the fragment.
pub fn canonical_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            url.set_fragment(None);
            let scheme = url.scheme().to_ascii_lowercase();
            let is_default_port = matches!(
                (scheme.as_str(), url.port()),
                ("http", Some(80)) | ("https", Some(443))
            );
            if is_default_port {
                let _ = url.set_port(None);
            }
            url.to_string()
        }
        // Opaque / non-URL sources (e.g. custom schemes) pass through
        // unchanged; they are still stable and filesystem-safe enough to
        // hash in `data_cache_key`.
        Err(_) => raw.to_string(),
    }
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// `dataCacheKey(request)`: derived from `imageId ?? canonical(source)`.
pub fn data_cache_key(request: &Request) -> DataCacheKey {
    let identity = match request.image_id() {
        Some(id) => id.to_string(),
        None => canonical_url(request.source.url()),
    };
    DataCacheKey(format!("images/v1/{}", sha256_hex(&identity)))
}

/// `imageCacheKey(request)`: `data-key + "|" + processor0.id + "|" + ...`.
pub fn image_cache_key(request: &Request) -> ImageCacheKey {
    let data_key = data_cache_key(request);
    let mut s = data_key.0.clone();
    for p in &request.processors {
        s.push('|');
        s.push_str(p.identifier());
        s.push(':');
        s.push_str(&p.key());
    }
    ImageCacheKey(s)
}

/// `loadKey(request)`: `dataCacheKey` plus the header subset that affects
/// the bytes returned (see [`LOAD_KEY_HEADERS`]).
pub fn load_key(request: &Request) -> LoadKey {
    let data_key = data_cache_key(request);
    let headers = request.source.headers();
    let relevant: BTreeSet<(String, String)> = headers
        .into_iter()
        .filter(|(k, _)| LOAD_KEY_HEADERS.contains(&k.to_ascii_lowercase().as_str()))
        .collect();

    if relevant.is_empty() {
        return LoadKey(data_key.0);
    }

    let mut s = data_key.0;
    for (k, v) in relevant {
        s.push('|');
        s.push_str(&k);
        s.push('=');
        s.push_str(&v);
    }
    LoadKey(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_url_normalizes_case_and_default_port() {
        assert_eq!(
            canonical_url("HTTP://Example.COM:80/a.jpg"),
            canonical_url("http://example.com/a.jpg"),
        );
    }

    #[test]
    fn canonical_url_drops_fragment() {
        assert_eq!(
            canonical_url("https://example.com/a.jpg#frag"),
            canonical_url("https://example.com/a.jpg"),
        );
    }

    #[test]
    fn canonical_url_keeps_non_default_port() {
        assert_ne!(
            canonical_url("https://example.com:8443/a.jpg"),
            canonical_url("https://example.com/a.jpg"),
        );
    }

    #[test]
    fn image_id_overrides_url_in_data_cache_key() {
        let by_url = Request::new("https://example.com/a.jpg");
        let by_id =
            Request::new("https://example.com/a.jpg").with_user_info("imageId", "stable-id-1");
        assert_ne!(data_cache_key(&by_url), data_cache_key(&by_id));

        let same_id_different_url = Request::new("https://example.com/b.jpg")
            .with_user_info("imageId", "stable-id-1");
        assert_eq!(data_cache_key(&by_id), data_cache_key(&same_id_different_url));
    }

    #[test]
    fn image_cache_key_depends_on_processor_sequence_order() {
        use crate::request::{Processor, ProcessorRef};
        use crate::container::ImageContainer;
        use std::sync::Arc;

        #[derive(Debug)]
        struct Named(&'static str);
        impl Processor for Named {
            fn identifier(&self) -> &str {
                self.0
            }
            fn key(&self) -> String {
                "k".to_string()
            }
            fn process(&self, input: &ImageContainer) -> crate::error::Result<Option<ImageContainer>> {
                Ok(Some(input.clone()))
            }
        }

        let a: ProcessorRef = Arc::new(Named("resize"));
        let b: ProcessorRef = Arc::new(Named("grayscale"));

        let ab = Request::new("https://example.com/a.jpg")
            .with_processor(a.clone())
            .with_processor(b.clone());
        let ba = Request::new("https://example.com/a.jpg")
            .with_processor(b)
            .with_processor(a);

        assert_ne!(image_cache_key(&ab), image_cache_key(&ba));
    }
}
