//! Error Types for Replicore Core
//!
//! This module defines the errors raised by the pure building blocks of the
//! ingestion core: topic name parsing and write-compute merging.
//!
//! ## Error Categories
//!
//! ### Naming Errors
//! - `InvalidTopic`: A topic name is neither a version topic (`store_v3`) nor a
//!   real-time topic (`store_rt`)
//!
//! ### Write-Compute Errors
//! - `UnknownField`: A partial update names a field the value schema doesn't have
//! - `FieldKindMismatch`: A collection operation targets a field of another kind
//! - `InvalidStoredValue`: The currently stored value is not a JSON object
//!
//! ### Codec Errors
//! - `Serialization`: A merged value could not be encoded or decoded
//!
//! ## Usage
//! All functions in the core return `Result<T>` which is aliased to
//! `Result<T, Error>`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid topic name: {0}")]
    InvalidTopic(String),

    #[error("Unknown field in write-compute record: {0}")]
    UnknownField(String),

    #[error("Field {field} is a {expected} field, got a {actual} operation")]
    FieldKindMismatch {
        field: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Stored value is not a record: {0}")]
    InvalidStoredValue(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Numeric code reported by the `write_compute_operation_failure` gauge.
    ///
    /// `0` is reserved for "no failure".
    pub fn write_compute_code(&self) -> i64 {
        match self {
            Error::InvalidTopic(_) => 1,
            Error::UnknownField(_) => 2,
            Error::FieldKindMismatch { .. } => 3,
            Error::InvalidStoredValue(_) => 4,
            Error::Serialization(_) => 5,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
