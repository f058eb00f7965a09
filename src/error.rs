//! Error types for Trueno-Select
//!
//! Every variant carries the ids or the offending field so a failure can be
//! diagnosed without re-running the request.

use crate::metadata::{PipelineId, TriggerId};
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Trueno-Select error types
#[derive(Error, Debug)]
pub enum Error {
    /// Bad strategy or selector parameters (never retried)
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Inform arrays of different lengths
    #[error("Length mismatch: got {keys} keys, {timestamps} timestamps and {labels} labels")]
    LengthMismatch {
        /// Number of keys supplied
        keys: usize,
        /// Number of timestamps supplied
        timestamps: usize,
        /// Number of labels supplied
        labels: usize,
    },

    /// Pipeline id was never issued
    #[error("Unknown pipeline: {0}")]
    UnknownPipeline(PipelineId),

    /// Trigger id was never produced for this pipeline
    #[error("Unknown trigger {trigger_id} for pipeline {pipeline_id}")]
    UnknownTrigger {
        /// Pipeline the trigger was requested from
        pipeline_id: PipelineId,
        /// Requested trigger
        trigger_id: TriggerId,
    },

    /// Worker or partition id outside the bounds of a finalized trigger
    #[error("{field} {value} out of range (must be < {bound})")]
    OutOfRange {
        /// Name of the offending field (`worker_id`, `partition_id`, ...)
        field: &'static str,
        /// Supplied value
        value: usize,
        /// Exclusive upper bound
        bound: usize,
    },

    /// Store-level uniqueness violation on insert (fatal, not ignored)
    #[error("Duplicate sample key {key} in pipeline {pipeline_id}")]
    DuplicateKey {
        /// Pipeline the insert targeted
        pipeline_id: PipelineId,
        /// Offending key
        key: i64,
    },

    /// Backend does not offer the requested capability
    #[error("Unsupported by metadata store: {0}")]
    Unsupported(String),

    /// Transient store failure, safe for the caller to retry
    #[error("Metadata store unavailable: {0}\nThe request may be retried")]
    StoreUnavailable(String),

    /// Query parsing error
    #[error("SQL parse error: {0}")]
    ParseError(String),

    /// Storage error (Parquet/Arrow)
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Parallel writer task failed
    #[error("Insertion task failed: {0}")]
    TaskFailed(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Arrow error
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Parquet error
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
}

impl Error {
    /// Whether the caller may retry the failed request unchanged
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}
