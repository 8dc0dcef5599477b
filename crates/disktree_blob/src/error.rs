//! Error types for the blob store.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BlobError>;

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Blob not found: {0}")]
    NotFound(String),

    /// A blob that cannot be decoded; the catalog row should be flagged
    /// `needs_repair` and the planner must skip it.
    #[error("Corrupt blob: {0}")]
    Corrupt(String),

    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

impl BlobError {
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidSnapshot(msg.into())
    }
}

impl From<parquet::errors::ParquetError> for BlobError {
    fn from(err: parquet::errors::ParquetError) -> Self {
        BlobError::Corrupt(err.to_string())
    }
}

impl From<arrow::error::ArrowError> for BlobError {
    fn from(err: arrow::error::ArrowError) -> Self {
        BlobError::Corrupt(err.to_string())
    }
}
