//! Error types for the response pipeline

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {

    // =============================
    // Core Pipeline Errors
    // =============================

    /// A single external data provider failed or timed out. Recovered
    /// locally by substituting an empty context bundle; never shown to
    /// the client directly.
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Generation timed out after {0}s")]
    GenerationTimeout(u64),

    #[error("Generation error: {0}")]
    GenerationError(String),

    #[error("Retrieval store has no indexed passages")]
    EmptyCorpus,

    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    /// Overall per-request deadline exceeded.
    #[error("Request deadline exceeded")]
    RequestTimeout,

    /// Delivery target disconnected; the response is discarded silently.
    #[error("Client {0} is gone")]
    ClientGone(uuid::Uuid),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl PipelineError {
    /// True when the failure may be surfaced to the client (as a uniform
    /// fallback message). Everything else is absorbed and degrades context
    /// quality instead of aborting the request.
    pub fn is_client_visible(&self) -> bool {
        matches!(
            self,
            PipelineError::GenerationTimeout(_)
                | PipelineError::GenerationError(_)
                | PipelineError::RequestTimeout
        )
    }
}
