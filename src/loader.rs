//! `DataLoader`: the pipeline's only HTTP-transport seam (spec.md §6).
//!
//! Grounded in `ferrex-player/src/domains/metadata/image_pipeline/loader.rs`'s
//! `HttpImageLoader` (pooled `reqwest::Client`, progress callback, retry
//! loop) and `ferrex-core/src/image_service.rs::download_variant`'s direct
//! `reqwest` usage, extended with Range/If-Range resumption per spec.md
//! §4.5.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::request::Request;

/// Previously stored partial bytes plus the validator needed to ask the
/// server whether they're still fresh (`If-Range`).
#[derive(Debug, Clone)]
pub struct PartialData {
    pub bytes: Vec<u8>,
    pub validator: String,
}

/// Bytes a `DataLoader` produced, plus enough metadata for the caller to
/// decide whether to persist a `ResumableDataStore` entry.
#[derive(Debug, Clone)]
pub struct LoadedData {
    pub bytes: Vec<u8>,
    /// True when these bytes are the product of successfully resuming a
    /// prior partial download (server honored `Range`/`If-Range`).
    pub resumed: bool,
    /// Validator (`ETag` or `Last-Modified`) to persist alongside any
    /// partial bytes retained for a future resume attempt.
    pub validator: Option<String>,
    pub total_size: Option<u64>,
}

/// Called with the accumulated bytes so far and the known total (if any)
/// on every received chunk, so `LoadImageData` can forward a non-final
/// `value` for progressive decoding (spec.md §4.5.d) without the
/// `DataLoader` needing to know anything about tasks or decoding.
pub type ProgressFn<'a> = &'a (dyn Fn(&[u8], Option<u64>) + Send + Sync);
pub type CancelledFn<'a> = &'a (dyn Fn() -> bool + Send + Sync);
/// Called when a transport failure occurs after some bytes were already
/// buffered, with whatever prefix + validator is available, so the caller
/// can offer it to a [`crate::resumable::ResumableDataStore`] "when the
/// response permits" (spec.md §4.5.e). Not every failure has a validator
/// to offer; implementations call this at most once per `load`.
pub type PartialFailureFn<'a> = &'a (dyn Fn(PartialData) + Send + Sync);

/// Fetches the bytes for a request's source. The only implementation the
/// core ships is HTTP-based; callers needing another transport implement
/// this trait themselves.
#[async_trait]
pub trait DataLoader: Send + Sync {
    async fn load(
        &self,
        request: &Request,
        resume: Option<PartialData>,
        on_progress: ProgressFn<'_>,
        is_cancelled: CancelledFn<'_>,
        on_partial_failure: PartialFailureFn<'_>,
    ) -> Result<LoadedData>;
}

/// `reqwest`-backed `DataLoader` with pooled connections and bounded retry,
/// matching `HttpImageLoader`'s shape.
pub struct ReqwestDataLoader {
    client: reqwest::Client,
    max_attempts: u32,
}

impl std::fmt::Debug for ReqwestDataLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestDataLoader")
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl Default for ReqwestDataLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ReqwestDataLoader {
    pub fn new() -> Self {
        Self::with_config(3, Duration::from_secs(30))
    }

    pub fn with_config(max_attempts: u32, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .timeout(timeout)
            .build()
            .expect("reqwest client configuration is valid");
        Self {
            client,
            max_attempts: max_attempts.max(1),
        }
    }

    async fn attempt(
        &self,
        request: &Request,
        resume: &Option<PartialData>,
        on_progress: ProgressFn<'_>,
        is_cancelled: CancelledFn<'_>,
        on_partial_failure: PartialFailureFn<'_>,
    ) -> Result<LoadedData> {
        let url = request.source.url();
        let mut builder = self.client.get(url);
        for (k, v) in request.source.headers() {
            builder = builder.header(k, v);
        }

        if let Some(partial) = resume {
            builder = builder
                .header("Range", format!("bytes={}-", partial.bytes.len()))
                .header("If-Range", partial.validator.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| PipelineError::DataLoadingFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() && status.as_u16() != 206 {
            return Err(PipelineError::DataLoadingFailed(format!(
                "HTTP {status}: {url}"
            )));
        }
        let is_partial_response = status.as_u16() == 206;

        let validator = response
            .headers()
            .get("etag")
            .or_else(|| response.headers().get("last-modified"))
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let content_length = response.content_length();
        let prefix_len = if is_partial_response {
            resume.as_ref().map(|p| p.bytes.len() as u64).unwrap_or(0)
        } else {
            0
        };
        let total_size = content_length.map(|len| len + prefix_len);

        let mut body = if is_partial_response {
            resume.as_ref().map(|p| p.bytes.clone()).unwrap_or_default()
        } else {
            Vec::new()
        };

        // One chunk of lookahead: `on_progress` is only called for a chunk
        // once we know another one follows it, so the chunk that completes
        // the body never gets a non-terminal progress callback — that
        // would duplicate the terminal `LoadedData` this function returns
        // (spec.md §4.5.d).
        let mut stream = response.bytes_stream();
        let mut pending = None;
        loop {
            if is_cancelled() {
                if let Some(validator) = &validator {
                    if !body.is_empty() {
                        on_partial_failure(PartialData {
                            bytes: body.clone(),
                            validator: validator.clone(),
                        });
                    }
                }
                return Err(PipelineError::Cancelled);
            }

            let next = stream.next().await;
            if let Some(chunk) = pending.take() {
                body.extend_from_slice(&chunk);
                if next.is_some() {
                    on_progress(&body, total_size);
                }
            }

            match next {
                Some(Ok(chunk)) => pending = Some(chunk),
                Some(Err(e)) => {
                    if let Some(validator) = &validator {
                        if !body.is_empty() {
                            on_partial_failure(PartialData {
                                bytes: body.clone(),
                                validator: validator.clone(),
                            });
                        }
                    }
                    return Err(PipelineError::DataLoadingFailed(e.to_string()));
                }
                None => break,
            }
        }

        if body.is_empty() {
            return Err(PipelineError::DataIsEmpty);
        }

        Ok(LoadedData {
            bytes: body,
            resumed: is_partial_response,
            validator,
            total_size,
        })
    }
}

#[async_trait]
impl DataLoader for ReqwestDataLoader {
    async fn load(
        &self,
        request: &Request,
        resume: Option<PartialData>,
        on_progress: ProgressFn<'_>,
        is_cancelled: CancelledFn<'_>,
        on_partial_failure: PartialFailureFn<'_>,
    ) -> Result<LoadedData> {
        let mut last_error = None;
        for attempt in 0..self.max_attempts {
            if is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            if attempt > 0 {
                let base = 100 * 2u64.pow(attempt);
                let jitter = rand::random::<u64>() % (base / 2 + 1);
                tokio::time::sleep(Duration::from_millis(base + jitter)).await;
            }
            match self
                .attempt(request, &resume, on_progress, is_cancelled, on_partial_failure)
                .await
            {
                Ok(data) => return Ok(data),
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, url = request.source.url(), "data load attempt failed");
                    last_error = Some(e);
                }
            }
        }
        debug!(url = request.source.url(), "data load exhausted retries");
        Err(last_error.unwrap_or(PipelineError::DataIsEmpty))
    }
}
