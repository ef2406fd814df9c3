use thiserror::Error;

/// The crate's single error currency. Every fallible operation in the
/// pipeline — from cache lookups through decode/process/encode — returns
/// this enum so callers only ever match one error type.
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    #[error("request had no source")]
    DataMissing,

    #[error("data loading failed: {0}")]
    DataLoadingFailed(String),

    #[error("transport reported success but delivered zero bytes")]
    DataIsEmpty,

    #[error("decoding failed: {0}")]
    DecodingFailed(String),

    #[error("processing failed for processor `{0}`")]
    ProcessingFailed(String),

    #[error("image request missing")]
    ImageRequestMissing,

    #[error("pipeline has been invalidated")]
    PipelineInvalidated,

    #[error("cache error: {0}")]
    Cache(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    /// Transient failures that should not terminate a progressive load —
    /// the pipeline waits for more data or moves on to the next input.
    pub fn is_transient_for_progressive_pass(&self) -> bool {
        matches!(
            self,
            PipelineError::DecodingFailed(_) | PipelineError::ProcessingFailed(_)
        )
    }
}
