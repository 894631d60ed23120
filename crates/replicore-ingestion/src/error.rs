//! Error types for Replicore Ingestion
//!
//! ## Classification
//!
//! | variant             | class          | handling inside a replica                       |
//! |---------------------|----------------|-------------------------------------------------|
//! | `SourceUnavailable` | transient      | retried with backoff, stale after a grace period |
//! | `Storage`           | processing     | retried before end of push, sticky after        |
//! | `WriteCompute`      | processing     | retried before end of push, sticky after        |
//! | `Configuration`     | non-retriable  | rejected before a replica starts                |
//!
//! A missing replica is never an error: control calls for unknown replicas
//! are no-ops and stats readings fall back to sentinels.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, IngestionError>;

#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Write-compute error: {0}")]
    WriteCompute(#[from] replicore_core::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl IngestionError {
    /// Transient failures of the source; retried without limit.
    pub fn is_retriable(&self) -> bool {
        matches!(self, IngestionError::SourceUnavailable(_))
    }

    /// Failures while applying a record.
    pub fn is_processing(&self) -> bool {
        matches!(
            self,
            IngestionError::Storage(_) | IngestionError::WriteCompute(_)
        )
    }

    /// Label used by the error counters.
    pub fn kind(&self) -> &'static str {
        match self {
            IngestionError::SourceUnavailable(_) => "source_unavailable",
            IngestionError::Storage(_) => "storage",
            IngestionError::WriteCompute(_) => "write_compute",
            IngestionError::Configuration(_) => "configuration",
            IngestionError::Join(_) => "join",
        }
    }

    /// Value of the `write_compute_operation_failure` gauge for this error.
    pub fn write_compute_code(&self) -> i64 {
        match self {
            IngestionError::WriteCompute(e) => e.write_compute_code(),
            _ => 0,
        }
    }
}
