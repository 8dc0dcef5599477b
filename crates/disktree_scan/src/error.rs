//! Error types for probes and the scan pipeline.

use disktree_protocol::ErrorKind;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ScanError>;

/// Fatal probe failures. Per-path failures inside a subtree are not errors;
/// they flow through the sink and end up sampled in the scan row.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Access denied on scan root: {0}")]
    RootPermission(String),

    #[error("Scan root does not exist: {0}")]
    RootNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object store error: {0}")]
    ObjectStore(String),

    #[error("Invalid probe configuration: {0}")]
    Config(String),
}

impl ProbeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProbeError::RootPermission(_) => ErrorKind::SourcePermission,
            ProbeError::RootNotFound(_) => ErrorKind::InvalidUri,
            ProbeError::Io(_) => ErrorKind::SourceTransient,
            ProbeError::ObjectStore(_) => ErrorKind::SourceTransient,
            ProbeError::Config(_) => ErrorKind::InvalidUri,
        }
    }
}

/// Pipeline failures: a fatal probe error or a commit failure.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] disktree_catalog::CatalogError),

    #[error("Blob error: {0}")]
    Blob(#[from] disktree_blob::BlobError),
}

impl ScanError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScanError::Probe(e) => e.kind(),
            ScanError::Catalog(_) => ErrorKind::CatalogConflict,
            ScanError::Blob(_) => ErrorKind::Internal,
        }
    }
}
