//! Service-level errors: every failure carries a taxonomy kind plus a
//! human-readable message, which is exactly what the HTTP layer serializes.

use disktree_protocol::{exit, ErrorKind};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ApiError>;

#[derive(Error, Debug, Serialize)]
#[error("{message}")]
pub struct ApiError {
    pub kind: ErrorKind,
    #[serde(rename = "error")]
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn invalid_uri(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidUri, message)
    }

    pub fn unsupported_scheme(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnsupportedScheme, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CatalogConflict, message)
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Aborted, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn exit_code(&self) -> i32 {
        exit::code_for(self.kind)
    }
}

impl From<disktree_protocol::UriError> for ApiError {
    fn from(err: disktree_protocol::UriError) -> Self {
        match err {
            disktree_protocol::UriError::UnsupportedScheme(_) => {
                Self::unsupported_scheme(err.to_string())
            }
            _ => Self::invalid_uri(err.to_string()),
        }
    }
}

impl From<disktree_catalog::CatalogError> for ApiError {
    fn from(err: disktree_catalog::CatalogError) -> Self {
        if err.is_conflict() {
            Self::conflict(err.to_string())
        } else {
            Self::internal(err.to_string())
        }
    }
}

impl From<disktree_blob::BlobError> for ApiError {
    fn from(err: disktree_blob::BlobError) -> Self {
        match err {
            disktree_blob::BlobError::Corrupt(_) => {
                Self::new(ErrorKind::BlobCorrupt, err.to_string())
            }
            _ => Self::internal(err.to_string()),
        }
    }
}

impl From<disktree_scan::ScanError> for ApiError {
    fn from(err: disktree_scan::ScanError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl From<disktree_scan::ProbeError> for ApiError {
    fn from(err: disktree_scan::ProbeError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}
