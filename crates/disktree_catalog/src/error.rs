//! Error types for the catalog layer.

use thiserror::Error;

/// Catalog operation result type.
pub type Result<T> = std::result::Result<T, CatalogError>;

/// Catalog errors.
#[derive(Error, Debug)]
pub enum CatalogError {
    /// SQLx error (connection, query, etc.)
    #[error("Catalog error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// IO error (file system operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Row contents that cannot be mapped back to a record
    #[error("Invalid row: {0}")]
    InvalidRow(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CatalogError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_row(msg: impl Into<String>) -> Self {
        Self::InvalidRow(msg.into())
    }

    /// True for conflicts worth retrying (locked database, busy writer).
    pub fn is_conflict(&self) -> bool {
        match self {
            CatalogError::Sqlx(sqlx::Error::Database(db)) => {
                let msg = db.message();
                msg.contains("locked") || msg.contains("busy")
            }
            _ => false,
        }
    }
}
