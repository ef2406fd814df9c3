//! `DataCache`: content-addressed byte storage for original (undecoded)
//! image data, and for re-encoded processed images under
//! `dataCachePolicy::storeEncodedImages` (spec.md §4.11).
//!
//! Grounded in `ferrex-core/src/infra/cache/image_store.rs`'s
//! `ImageBlobStore`, a thin typed wrapper over `cacache`.
//!
//! Keyed by plain `&str` rather than a single newtype: the pipeline
//! addresses this store with both [`crate::keys::DataCacheKey`] (original
//! bytes) and [`crate::keys::ImageCacheKey`] (processed images), and both
//! expose `.as_str()` — a shared string-keyed interface avoids giving the
//! trait two near-identical methods per key type.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::{PipelineError, Result};

/// Disk byte store addressed by a stable string key. Disk-format/layout
/// decisions are explicitly out of scope (spec.md §1) beyond what this
/// interface requires of an implementation.
#[async_trait]
pub trait DataCache: Send + Sync {
    async fn cached_data(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn store_data(&self, key: &str, data: &[u8]) -> Result<()>;
    async fn remove_data(&self, key: &str) -> Result<()>;
    async fn remove_all(&self) -> Result<()>;
    async fn contains_data(&self, key: &str) -> Result<bool> {
        Ok(self.cached_data(key).await?.is_some())
    }
}

/// Default `DataCache`, backed by `cacache`'s content-addressed store.
#[derive(Clone, Debug)]
pub struct CacacheDataCache {
    root: PathBuf,
}

impl CacacheDataCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn map_cacache_err(key: &str, err: cacache::Error) -> PipelineError {
    match err {
        cacache::Error::EntryNotFound(_, _) => PipelineError::DataMissing,
        cacache::Error::IntegrityError(e) => {
            PipelineError::Cache(format!("integrity check failed for {key}: {e}"))
        }
        cacache::Error::SizeMismatch(wanted, actual) => PipelineError::Cache(format!(
            "size mismatch for {key}: wanted {wanted}, actual {actual}"
        )),
        cacache::Error::IoError(_, msg) => PipelineError::Cache(format!("I/O error: {msg}")),
        cacache::Error::SerdeError(_, msg) => PipelineError::Cache(format!("serde error: {msg}")),
    }
}

#[async_trait]
impl DataCache for CacacheDataCache {
    async fn cached_data(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match cacache::read(&self.root, key).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(cacache::Error::EntryNotFound(_, _)) => Ok(None),
            Err(e) => Err(map_cacache_err(key, e)),
        }
    }

    async fn store_data(&self, key: &str, data: &[u8]) -> Result<()> {
        cacache::write(&self.root, key, data)
            .await
            .map_err(|e| map_cacache_err(key, e))?;
        Ok(())
    }

    async fn remove_data(&self, key: &str) -> Result<()> {
        let opts = cacache::index::RemoveOpts::new().remove_fully(true);
        opts.remove(&self.root, key)
            .await
            .map_err(|e| map_cacache_err(key, e))
    }

    async fn remove_all(&self) -> Result<()> {
        cacache::clear(&self.root)
            .await
            .map_err(|e| PipelineError::Cache(format!("clear failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacacheDataCache::new(dir.path());
        let cache_key = crate::keys::data_cache_key(&crate::request::Request::new(
            "https://example.com/a.jpg",
        ));
        let cache_key = cache_key.as_str();

        assert!(cache.cached_data(cache_key).await.unwrap().is_none());
        cache.store_data(cache_key, b"hello").await.unwrap();
        assert_eq!(
            cache.cached_data(cache_key).await.unwrap().unwrap(),
            b"hello"
        );
        assert!(cache.contains_data(cache_key).await.unwrap());

        cache.remove_data(cache_key).await.unwrap();
        assert!(cache.cached_data(cache_key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_all_clears_every_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacacheDataCache::new(dir.path());
        let a = crate::keys::data_cache_key(&crate::request::Request::new("https://example.com/a.jpg"));
        let b = crate::keys::data_cache_key(&crate::request::Request::new("https://example.com/b.jpg"));
        cache.store_data(a.as_str(), b"a").await.unwrap();
        cache.store_data(b.as_str(), b"b").await.unwrap();

        cache.remove_all().await.unwrap();

        assert!(cache.cached_data(a.as_str()).await.unwrap().is_none());
        assert!(cache.cached_data(b.as_str()).await.unwrap().is_none());
    }
}
