//! Error taxonomy for the memory engine.
//!
//! Library code returns these specific variants so callers can match on
//! failure mode; the CLI boundary (`main.rs`) flattens everything into
//! `anyhow::Result` for display.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecallError {
    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("invalid tenant/project scope: {0}")]
    NamespaceValidationError(String),

    #[error("storage backend unavailable: {0}")]
    StorageBackendUnavailable(String),

    #[error("failed to parse ingest source: {0}")]
    IngestParseError(String),

    #[error("extraction timed out after {0:?}")]
    ExtractionTimeout(std::time::Duration),

    #[error("extraction rate limited, retry after {0:?}")]
    ExtractionRateLimited(Option<std::time::Duration>),

    #[error("extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("tier file validation failed: {0}")]
    TierValidationError(String),

    #[error("failed to spawn iteration loop subprocess: {0}")]
    LoopSpawnError(String),

    #[error("iteration budget exceeded: spent {spent}, budget {budget}")]
    BudgetExceeded { spent: f64, budget: f64 },
}
