//! The mutation path: delete a filesystem entry and repair every snapshot
//! whose aggregates it participated in.
//!
//! Blob rewrites are write-new-then-swap: the repaired snapshot is
//! committed under a fresh blob id, the catalog row is pointed at it, and
//! only then is the old blob removed. A snapshot that cannot be repaired
//! is flagged `needs_repair` so the planner skips it.

use crate::error::{ApiError, Result};
use disktree_blob::{BlobId, BlobStore, NodePredicate};
use disktree_catalog::Catalog;
use disktree_protocol::{DeleteResult, Node, ScanRecord, Scheme, Snapshot, Uri};
use std::path::Path;
use std::str::FromStr;
use tracing::{info, warn};

pub struct Mutator<'a> {
    catalog: &'a Catalog,
    blobs: &'a BlobStore,
}

impl<'a> Mutator<'a> {
    pub fn new(catalog: &'a Catalog, blobs: &'a BlobStore) -> Self {
        Self { catalog, blobs }
    }

    /// Delete `uri` from the local filesystem and keep derived snapshot
    /// aggregates consistent.
    pub async fn delete(&self, uri: &Uri) -> Result<DeleteResult> {
        if uri.scheme() == Scheme::Object {
            return Err(ApiError::unsupported_scheme(
                "object store deletes are not supported",
            ));
        }
        if uri.is_scheme_root() {
            return Err(ApiError::invalid_uri("refusing to delete the scheme root"));
        }

        let path = Path::new(uri.as_str());
        if !path.exists() {
            return Err(ApiError::not_found(format!("{uri} does not exist")));
        }

        // Aggregates from the smallest covering snapshot; filesystem walk
        // when nothing covers the path yet
        let (deleted_size, deleted_n_desc) = match self.lookup_aggregates(uri).await? {
            Some(found) => found,
            None => walk_aggregates(path),
        };

        let errors = remove_tree(path);

        self.repair_covering(uri).await?;
        self.drop_scans_under(uri).await?;

        info!(
            %uri,
            deleted_size,
            deleted_n_desc,
            errors = errors.len(),
            "Delete finished"
        );

        Ok(DeleteResult {
            ok: errors.is_empty(),
            uri: uri.clone(),
            deleted_size,
            deleted_n_desc,
            errors,
        })
    }

    /// `(size, n_desc)` of `uri` from the freshest snapshot containing it.
    async fn lookup_aggregates(&self, uri: &Uri) -> Result<Option<(u64, u64)>> {
        for record in self.catalog.scans_covering(uri).await? {
            let Ok(reader) = self.open_blob(&record) else { continue };
            let nodes = reader.scan(&NodePredicate {
                uri_eq: Some(uri.clone()),
                ..Default::default()
            })?;
            if let Some(node) = nodes.first() {
                return Ok(Some((node.size, node.n_desc)));
            }
        }
        Ok(None)
    }

    /// Rewrite every snapshot rooted strictly above `uri`.
    async fn repair_covering(&self, uri: &Uri) -> Result<()> {
        for record in self.catalog.scans_covering(uri).await? {
            if record.root_uri == *uri {
                continue; // dropped wholesale by drop_scans_under
            }
            if let Err(err) = self.repair_one(&record, uri).await {
                warn!(scan_id = record.id, error = %err, "Repair deferred");
                self.catalog.mark_needs_repair(record.id, true).await?;
            }
        }
        Ok(())
    }

    async fn repair_one(&self, record: &ScanRecord, uri: &Uri) -> Result<()> {
        let reader = self.open_blob(record)?;
        let meta = reader.meta().clone();
        let nodes = reader.scan(&NodePredicate::default())?;

        let Some(rewritten) = remove_subtree(nodes, &record.root_uri, uri) else {
            return Ok(()); // snapshot predates the path; nothing to repair
        };

        let root = rewritten
            .first()
            .ok_or_else(|| ApiError::internal("repair emptied the snapshot"))?
            .clone();

        let new_blob = self.blobs.put(&Snapshot {
            root_uri: record.root_uri.clone(),
            completed_at: meta.completed_at,
            error_count: meta.error_count,
            error_paths: record.error_paths.clone(),
            nodes: rewritten,
        })?;

        if let Err(err) = self
            .catalog
            .update_scan_after_repair(
                record.id,
                new_blob.as_str(),
                root.size,
                root.n_children,
                root.n_desc,
            )
            .await
        {
            let _ = self.blobs.delete(&new_blob);
            return Err(err.into());
        }

        if let Ok(old) = BlobId::from_str(&record.blob_id) {
            let _ = self.blobs.delete(&old);
        }

        info!(scan_id = record.id, blob_id = %new_blob, "Snapshot repaired");
        Ok(())
    }

    /// Scans whose entire subject was just deleted have nothing left to
    /// describe; drop row and blob.
    async fn drop_scans_under(&self, uri: &Uri) -> Result<()> {
        for record in self.catalog.scans_under(uri).await? {
            self.catalog.delete_scan(record.id).await?;
            if let Ok(blob_id) = BlobId::from_str(&record.blob_id) {
                let _ = self.blobs.delete(&blob_id);
            }
            info!(scan_id = record.id, root = %record.root_uri, "Dropped scan under deleted path");
        }
        Ok(())
    }

    fn open_blob(&self, record: &ScanRecord) -> Result<disktree_blob::SnapshotReader> {
        let blob_id = BlobId::from_str(&record.blob_id)?;
        Ok(self.blobs.open(&blob_id)?)
    }
}

/// Remove `target` and its descendants from a node list and fix up the
/// ancestors. Returns `None` when the target is absent from the snapshot.
fn remove_subtree(nodes: Vec<Node>, snapshot_root: &Uri, target: &Uri) -> Option<Vec<Node>> {
    let removed = nodes.iter().find(|n| &n.uri == target)?;
    let deleted_size = removed.size;
    let deleted_count = removed.n_desc + 1;
    let parent_uri = target.parent();

    let mut kept: Vec<Node> = nodes
        .into_iter()
        .filter(|n| !target.is_ancestor_of(&n.uri))
        .collect();

    for node in kept.iter_mut() {
        if node.uri.is_ancestor_of(target) && &node.uri != target {
            node.size = node.size.saturating_sub(deleted_size);
            node.n_desc = node.n_desc.saturating_sub(deleted_count);
        }
        if Some(&node.uri) == parent_uri.as_ref() {
            node.n_children = node.n_children.saturating_sub(1);
        }
    }

    debug_assert!(kept.iter().any(|n| &n.uri == snapshot_root));
    Some(kept)
}

/// Recursive best-effort removal, collecting per-path failures instead of
/// stopping at the first one.
fn remove_tree(path: &Path) -> Vec<String> {
    let mut errors = Vec::new();

    if path.is_file() || path.is_symlink() {
        if let Err(err) = std::fs::remove_file(path) {
            errors.push(format!("{}: {err}", path.display()));
        }
        return errors;
    }

    for entry in walkdir::WalkDir::new(path).contents_first(true) {
        match entry {
            Ok(entry) => {
                let result = if entry.file_type().is_dir() {
                    std::fs::remove_dir(entry.path())
                } else {
                    std::fs::remove_file(entry.path())
                };
                if let Err(err) = result {
                    errors.push(format!("{}: {err}", entry.path().display()));
                }
            }
            Err(err) => {
                let display = err
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| path.display().to_string());
                errors.push(format!("{display}: {err}"));
            }
        }
    }
    errors
}

/// Fallback aggregates straight from the filesystem.
fn walk_aggregates(path: &Path) -> (u64, u64) {
    if path.is_file() {
        let size = path
            .metadata()
            .map(|m| allocated_size(&m))
            .unwrap_or(0);
        return (size, 0);
    }

    let mut size = 0u64;
    let mut n_desc = 0u64;
    for entry in walkdir::WalkDir::new(path).into_iter().flatten() {
        if entry.depth() == 0 {
            continue;
        }
        n_desc += 1;
        if entry.file_type().is_file() {
            if let Ok(meta) = entry.metadata() {
                size += allocated_size(&meta);
            }
        }
    }
    (size, n_desc)
}

#[cfg(unix)]
fn allocated_size(metadata: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.blocks() * 512
}

#[cfg(not(unix))]
fn allocated_size(metadata: &std::fs::Metadata) -> u64 {
    metadata.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use disktree_protocol::NodeKind;

    fn node(uri: &str, kind: NodeKind, size: u64, depth: u32, n_children: u32, n_desc: u64) -> Node {
        let uri = Uri::parse(uri).unwrap();
        Node {
            parent: if depth == 0 { None } else { uri.parent() },
            uri,
            kind,
            size,
            mtime: 10,
            depth,
            n_children,
            n_desc,
        }
    }

    #[test]
    fn remove_subtree_fixes_ancestor_aggregates() {
        // /P (size 20, 6 desc) -> Q (7, 4 desc incl. two files + sub),
        //                      -> r.bin (13)
        let root = Uri::parse("/P").unwrap();
        let target = Uri::parse("/P/Q").unwrap();
        let nodes = vec![
            node("/P", NodeKind::Dir, 20, 0, 2, 6),
            node("/P/Q", NodeKind::Dir, 7, 1, 2, 4),
            node("/P/r.bin", NodeKind::File, 13, 1, 0, 0),
            node("/P/Q/a.bin", NodeKind::File, 3, 2, 0, 0),
            node("/P/Q/sub", NodeKind::Dir, 4, 2, 1, 1),
            node("/P/Q/sub/b.bin", NodeKind::File, 4, 3, 0, 0),
        ];

        let kept = remove_subtree(nodes, &root, &target).unwrap();
        assert_eq!(kept.len(), 2);

        let root_node = kept.iter().find(|n| n.uri.as_str() == "/P").unwrap();
        assert_eq!(root_node.size, 13); // 20 - 7
        assert_eq!(root_node.n_desc, 1); // 6 - (4 + 1)
        assert_eq!(root_node.n_children, 1);
    }

    #[test]
    fn remove_subtree_of_absent_target_is_none() {
        let root = Uri::parse("/P").unwrap();
        let nodes = vec![node("/P", NodeKind::Dir, 0, 0, 0, 0)];
        assert!(remove_subtree(nodes, &root, &Uri::parse("/P/gone").unwrap()).is_none());
    }

    #[test]
    fn remove_tree_collects_errors_and_continues() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("victim");
        std::fs::create_dir_all(dir.join("sub")).unwrap();
        std::fs::write(dir.join("a"), b"1").unwrap();
        std::fs::write(dir.join("sub/b"), b"2").unwrap();

        let errors = remove_tree(&dir);
        assert!(errors.is_empty());
        assert!(!dir.exists());
    }
}
