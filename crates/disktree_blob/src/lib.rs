//! Columnar snapshot storage.
//!
//! Each scan's tree snapshot is persisted as one Parquet file, addressed by
//! an opaque [`BlobId`]. Rows are sorted by `(depth, uri)` and each row
//! group's depth range is recorded in the file footer, so a depth predicate
//! is answered by decoding only the leading row groups (see [`reader`]).
//! Writes are atomic: staged to a `.tmp` file and renamed into place.

mod error;
mod reader;
mod writer;

pub use error::{BlobError, Result};
pub use reader::{NodePredicate, SnapshotMeta, SnapshotReader};

use disktree_protocol::Snapshot;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

/// Opaque identifier of a stored snapshot blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobId(String);

impl BlobId {
    fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BlobId {
    type Err = BlobError;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty()
            || !s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(BlobError::invalid(format!("bad blob id: '{s}'")));
        }
        Ok(Self(s.to_string()))
    }
}

/// Directory-backed store of snapshot blobs. Owns the blob bytes; the
/// catalog owns which ids are referenced.
#[derive(Debug, Clone)]
pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    /// Open (creating if needed) a blob directory.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, id: &BlobId) -> PathBuf {
        self.dir.join(format!("{}.parquet", id.as_str()))
    }

    /// Persist a snapshot, returning its new id. Atomic: the file appears
    /// fully written or not at all.
    pub fn put(&self, snapshot: &Snapshot) -> Result<BlobId> {
        let id = BlobId::generate();
        let final_path = self.path_for(&id);
        let tmp_path = self.dir.join(format!(".{}.parquet.tmp", id.as_str()));

        if let Err(err) = writer::write_snapshot(&tmp_path, snapshot) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(err);
        }

        std::fs::rename(&tmp_path, &final_path)?;
        debug!(blob_id = %id, nodes = snapshot.nodes.len(), "Snapshot blob committed");
        Ok(id)
    }

    /// Open a blob for reading.
    pub fn open(&self, id: &BlobId) -> Result<SnapshotReader> {
        let path = self.path_for(id);
        if !path.exists() {
            return Err(BlobError::NotFound(id.to_string()));
        }
        SnapshotReader::open(&path)
    }

    /// Remove a blob. Missing files are fine (a crashed GC may have won).
    pub fn delete(&self, id: &BlobId) -> Result<()> {
        match std::fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Ids of every committed blob in the directory. Stale `.tmp` files
    /// from crashed writers are swept here.
    pub fn list(&self) -> Result<Vec<BlobId>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();

            if name.starts_with('.') && name.ends_with(".tmp") {
                warn!(file = %name, "Removing orphaned temp blob");
                let _ = std::fs::remove_file(entry.path());
                continue;
            }

            if let Some(stem) = name.strip_suffix(".parquet") {
                if let Ok(id) = BlobId::from_str(stem) {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }
}
