//! Error types for Silt

use thiserror::Error;

/// Result type alias for Silt operations
pub type Result<T> = std::result::Result<T, SiltError>;

/// Silt error types
#[derive(Error, Debug)]
pub enum SiltError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Reader and writer schemas cannot be reconciled
    #[error("Schema incompatibility: {0}")]
    SchemaCompatibility(String),

    /// Record key could not be derived from a row
    #[error("Key generation error: {0}")]
    KeyGeneration(String),

    /// Timeline state error
    #[error("Timeline error: {0}")]
    Timeline(String),

    /// Compaction scheduling or execution error
    #[error("Compaction error: {0}")]
    Compaction(String),

    /// Rollback error
    #[error("Rollback error: {0}")]
    Rollback(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SiltError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, SiltError::Io(_))
    }

    /// Check if error indicates corruption of on-disk data
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            SiltError::Corruption(_) | SiltError::ChecksumMismatch { .. }
        )
    }
}
