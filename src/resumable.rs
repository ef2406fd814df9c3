//! `ResumableDataStore`: holds partial bytes from an interrupted download
//! so a retried load can resume via `Range`/`If-Range` instead of starting
//! over (spec.md §4.5).

use std::collections::HashMap;
use std::sync::Mutex;

use crate::loader::PartialData;

/// Keyed by canonical URL (not the full `loadKey`, since resumption only
/// cares about which bytes were fetched, not cache-control headers).
#[derive(Default)]
pub struct ResumableDataStore {
    entries: Mutex<HashMap<String, PartialData>>,
}

impl std::fmt::Debug for ResumableDataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumableDataStore")
            .field("entries", &self.entries.lock().unwrap().len())
            .finish()
    }
}

impl ResumableDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take (remove) any partial data stored for `canonical_url`. Consumed
    /// at most once per retry cycle: a failed resume attempt does not put
    /// the bytes back, since the validator may already be stale.
    pub fn take(&self, canonical_url: &str) -> Option<PartialData> {
        self.entries.lock().unwrap().remove(canonical_url)
    }

    pub fn store(&self, canonical_url: String, partial: PartialData) {
        self.entries.lock().unwrap().insert(canonical_url, partial);
    }

    pub fn remove(&self, canonical_url: &str) {
        self.entries.lock().unwrap().remove(canonical_url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_consumes_the_entry() {
        let store = ResumableDataStore::new();
        store.store(
            "https://example.com/a.jpg".to_string(),
            PartialData {
                bytes: vec![1, 2, 3],
                validator: "etag-1".to_string(),
            },
        );
        assert!(store.take("https://example.com/a.jpg").is_some());
        assert!(store.take("https://example.com/a.jpg").is_none());
    }
}
