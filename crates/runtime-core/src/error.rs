//! Error types for the fine-tuning support runtime

use thiserror::Error;

/// Result type alias using the runtime Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type shared by every crate in the workspace
#[derive(Error, Debug)]
pub enum Error {
    // Tensor and dtype errors
    #[error("`dtype` is not a valid dtype: {dtype}")]
    UnsupportedDtype { dtype: String },

    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Invalid tensor data: {message}")]
    InvalidTensorData { message: String },

    #[error("Value is not movable to a device: {kind}")]
    NotMovable { kind: String },

    // Parameter partitioning errors
    #[error("Parameter partition {partition_id} is not available (status {status})")]
    PartitionUnavailable { partition_id: u64, status: String },

    // Distributed errors
    #[error("Distributed context is not initialized")]
    DistributedNotInitialized,

    #[error("Collective {operation} failed: {message}")]
    CollectiveFailed { operation: String, message: String },

    // Checkpoint errors
    #[error("Checkpoint write failed: {message}")]
    CheckpointWriteFailed { message: String },

    // Storage errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Returns true if this error indicates a fatal condition
    ///
    /// Nothing in the runtime retries; fatal errors are the ones that mean the
    /// job itself is misconfigured rather than a single call having failed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedDtype { .. }
                | Error::InvalidConfig { .. }
                | Error::DistributedNotInitialized
        )
    }

    /// Build an [`Error::UnsupportedDtype`] from any displayable dtype
    pub fn unsupported_dtype(dtype: impl std::fmt::Display) -> Self {
        Error::UnsupportedDtype {
            dtype: dtype.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
