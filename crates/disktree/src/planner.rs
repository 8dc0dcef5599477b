//! The query planner: answers "what do I know about URI X?" by slicing an
//! ancestor snapshot and patching in fresher child scans.
//!
//! Patching is deliberately single-level: a fresher scan rooted at a direct
//! child replaces that child's aggregates; anything deeper only flags the
//! enclosing depth-1 child as partially fresh. The returned view is
//! internally consistent at the root and depth 1; deeper rows may be stale
//! relative to their displayed parent.

use crate::error::{ApiError, Result};
use disktree_blob::{BlobStore, NodePredicate, SnapshotReader};
use disktree_catalog::Catalog;
use disktree_protocol::{
    CompareRow, CompareStatus, Comparison, Node, NodeKind, ScanRecord, ScanStatus, Scanned, Uri,
    View, ViewNode,
};
use std::collections::BTreeMap;
use tracing::warn;

pub struct Planner<'a> {
    catalog: &'a Catalog,
    blobs: &'a BlobStore,
}

impl<'a> Planner<'a> {
    pub fn new(catalog: &'a Catalog, blobs: &'a BlobStore) -> Self {
        Self { catalog, blobs }
    }

    /// The smallest correct tree rooted at `uri` with all descendants down
    /// to `depth`, using the freshest data the catalog offers.
    pub async fn view(&self, uri: &Uri, depth: u32) -> Result<View> {
        // Resolve the ancestor, skipping snapshots that turn out corrupt
        let (anc, reader) = loop {
            let Some(anc) = self.catalog.ancestor_scan_for(uri).await? else {
                return Ok(View::none());
            };
            match self.open_scan(&anc) {
                Ok(reader) => break (anc, reader),
                Err(err) => {
                    warn!(scan_id = anc.id, error = %err, "Snapshot unreadable, flagging for repair");
                    self.catalog.mark_needs_repair(anc.id, true).await?;
                }
            }
        };

        let target_depth = uri
            .depth_below(&anc.root_uri)
            .ok_or_else(|| ApiError::internal("ancestor scan does not cover target"))?;

        let base = reader.scan(&NodePredicate {
            depth_le: Some(target_depth + depth),
            uri_prefix: Some(uri.clone()),
            ..Default::default()
        })?;

        // The ancestor may predate the path's creation
        if !base.iter().any(|n| &n.uri == uri) {
            return Ok(View::none());
        }

        let mut rows: Vec<ViewNode> = base
            .iter()
            .filter_map(|node| rebase(node, uri, target_depth, anc.completed_at))
            .collect();

        // Fresher-child patching, newest scan per child wins
        let fresher = self
            .catalog
            .fresher_children_of(uri, anc.completed_at)
            .await?;
        let mut patched = false;
        let mut partial = false;
        if depth >= 1 {
            let mut claimed: BTreeMap<String, ()> = BTreeMap::new();
            for scan in &fresher {
                let Some(rel) = scan.root_uri.relative_to(uri) else { continue };
                let child_depth = scan
                    .root_uri
                    .depth_below(uri)
                    .unwrap_or(u32::MAX);

                if child_depth == 1 {
                    if claimed.insert(rel.clone(), ()).is_some() {
                        continue; // an older scan of the same child
                    }
                    patch_child(&mut rows, uri, &rel, scan);
                    patched = true;
                } else {
                    // Deeper than one level: flag the enclosing child as
                    // "something below is fresher" unless its own direct
                    // scan already patched it
                    let Some(first) = rel.split('/').next() else { continue };
                    if claimed.get(first).is_some() {
                        continue;
                    }
                    if let Some(row) = rows.iter_mut().find(|r| r.path == first) {
                        row.scanned = Scanned::Partial;
                        partial = true;
                    }
                }
            }
        }

        // Re-roll the root from its (possibly patched) direct children so
        // the top row reflects the mixed-freshness data
        let root_is_dir = rows
            .iter()
            .find(|r| r.path == ".")
            .map(|r| r.kind == NodeKind::Dir)
            .unwrap_or(false);
        if root_is_dir && depth >= 1 {
            reroll_root(&mut rows);
        }

        let root = rows
            .iter()
            .find(|r| r.path == ".")
            .cloned()
            .ok_or_else(|| ApiError::internal("view lost its root row"))?;

        let mut children: Vec<ViewNode> =
            rows.iter().filter(|r| r.depth == 1).cloned().collect();
        children.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.path.cmp(&b.path)));

        let status = if anc.root_uri == *uri && !patched && !partial {
            ScanStatus::Full
        } else {
            ScanStatus::Partial
        };

        let rows: Vec<ViewNode> = rows.into_iter().filter(|r| r.depth > 0).collect();

        Ok(View {
            status,
            root: Some(root),
            children,
            rows,
            completed_at: Some(anc.completed_at),
            scan_root: Some(anc.root_uri.clone()),
            scan_id: Some(anc.id),
        })
    }

    /// Row-per-child diff of `uri` between two scans.
    pub async fn compare(&self, uri: &Uri, scan_a: i64, scan_b: i64) -> Result<Comparison> {
        let a = self.load_cover(uri, scan_a).await?;
        let b = self.load_cover(uri, scan_b).await?;

        let children_a = self.direct_children(uri, &a)?;
        let children_b = self.direct_children(uri, &b)?;

        let mut names: Vec<String> = children_a.keys().cloned().collect();
        for name in children_b.keys() {
            if !children_a.contains_key(name) {
                names.push(name.clone());
            }
        }
        names.sort();

        let mut rows = Vec::with_capacity(names.len());
        let mut total_delta = 0i64;
        for name in names {
            let old = children_a.get(&name);
            let new = children_b.get(&name);
            let status = match (old, new) {
                (None, Some(_)) => CompareStatus::Added,
                (Some(_), None) => CompareStatus::Removed,
                (Some(o), Some(n)) if o == n => CompareStatus::Unchanged,
                _ => CompareStatus::Changed,
            };
            let size_old = old.map(|(s, _)| *s);
            let size_new = new.map(|(s, _)| *s);
            let size_delta = size_new.unwrap_or(0) as i64 - size_old.unwrap_or(0) as i64;
            total_delta += size_delta;

            rows.push(CompareRow {
                path: name,
                status,
                size_old,
                size_new,
                size_delta,
                n_desc_old: old.map(|(_, d)| *d),
                n_desc_new: new.map(|(_, d)| *d),
                n_desc_delta: new.map(|(_, d)| *d).unwrap_or(0) as i64
                    - old.map(|(_, d)| *d).unwrap_or(0) as i64,
            });
        }

        Ok(Comparison {
            uri: uri.clone(),
            scan_a,
            scan_b,
            rows,
            total_delta,
        })
    }

    fn open_scan(&self, record: &ScanRecord) -> Result<SnapshotReader> {
        let blob_id = record
            .blob_id
            .parse()
            .map_err(|e: disktree_blob::BlobError| ApiError::from(e))?;
        Ok(self.blobs.open(&blob_id)?)
    }

    async fn load_cover(&self, uri: &Uri, scan_id: i64) -> Result<ScanRecord> {
        let record = self
            .catalog
            .get_scan(scan_id)
            .await?
            .ok_or_else(|| ApiError::not_found(format!("No scan with id {scan_id}")))?;
        if !record.root_uri.is_ancestor_of(uri) {
            return Err(ApiError::not_found(format!(
                "Scan {scan_id} (root {}) does not cover {uri}",
                record.root_uri
            )));
        }
        Ok(record)
    }

    /// Direct children of `uri` in one scan, keyed by suffix path, valued
    /// `(size, n_desc)`.
    fn direct_children(
        &self,
        uri: &Uri,
        record: &ScanRecord,
    ) -> Result<BTreeMap<String, (u64, u64)>> {
        let reader = self.open_scan(record)?;
        let target_depth = uri
            .depth_below(&record.root_uri)
            .ok_or_else(|| ApiError::internal("covering scan lost its target"))?;

        let nodes = reader.scan(&NodePredicate {
            depth_le: Some(target_depth + 1),
            uri_prefix: Some(uri.clone()),
            ..Default::default()
        })?;

        if !nodes.iter().any(|n| &n.uri == uri) {
            return Err(ApiError::not_found(format!(
                "Scan {} does not contain {uri}",
                record.id
            )));
        }

        Ok(nodes
            .iter()
            .filter(|n| n.depth == target_depth + 1)
            .filter_map(|n| {
                n.uri
                    .relative_to(uri)
                    .map(|rel| (rel, (n.size, n.n_desc)))
            })
            .collect())
    }
}

/// Rewrite one snapshot node so `target` is the new root.
fn rebase(node: &Node, target: &Uri, target_depth: u32, scan_time: i64) -> Option<ViewNode> {
    let rel_depth = node.depth.checked_sub(target_depth)?;
    let path = node.uri.relative_to(target)?;
    let parent = match rel_depth {
        0 => None,
        1 => Some(".".to_string()),
        _ => node
            .parent
            .as_ref()
            .and_then(|p| p.relative_to(target)),
    };

    Some(ViewNode {
        path,
        uri: node.uri.clone(),
        kind: node.kind,
        size: node.size,
        mtime: node.mtime,
        parent,
        depth: rel_depth,
        n_children: node.n_children,
        n_desc: node.n_desc,
        scanned: Scanned::Yes,
        scan_time: Some(scan_time),
    })
}

/// Replace (or insert) the direct child `rel` with the denormalized
/// aggregates of a fresher scan.
fn patch_child(rows: &mut Vec<ViewNode>, target: &Uri, rel: &str, scan: &ScanRecord) {
    if let Some(row) = rows.iter_mut().find(|r| r.path == rel) {
        row.size = scan.root_size;
        row.n_children = scan.root_n_children;
        row.n_desc = scan.root_n_desc;
        row.scanned = Scanned::Yes;
        row.scan_time = Some(scan.completed_at);
        return;
    }

    // The child was created after the ancestor scan; its own scan proves it
    rows.push(ViewNode {
        path: rel.to_string(),
        uri: scan.root_uri.clone(),
        kind: NodeKind::Dir,
        size: scan.root_size,
        mtime: 0,
        parent: Some(".".to_string()),
        depth: 1,
        n_children: scan.root_n_children,
        n_desc: scan.root_n_desc,
        scanned: Scanned::Yes,
        scan_time: Some(scan.completed_at),
    });
}

/// Recompute the root row's aggregates from its direct children.
fn reroll_root(rows: &mut [ViewNode]) {
    let mut size = 0u64;
    let mut n_children = 0u32;
    let mut n_desc_sum = 0u64;
    let mut mtime = 0i64;
    for row in rows.iter() {
        if row.depth == 1 {
            size += row.size;
            n_children += 1;
            n_desc_sum += row.n_desc;
            mtime = mtime.max(row.mtime);
        }
    }

    if let Some(root) = rows.iter_mut().find(|r| r.depth == 0) {
        root.size = size;
        root.n_children = n_children;
        root.n_desc = n_children as u64 + n_desc_sum;
        if mtime > 0 {
            root.mtime = mtime;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(uri: &str, kind: NodeKind, size: u64, depth: u32) -> Node {
        let uri = Uri::parse(uri).unwrap();
        Node {
            parent: uri.parent(),
            uri,
            kind,
            size,
            mtime: 100,
            depth,
            n_children: 0,
            n_desc: 0,
        }
    }

    #[test]
    fn rebase_rewrites_paths_relative_to_target() {
        let target = Uri::parse("/home/u/docs").unwrap();

        let root = rebase(&node("/home/u/docs", NodeKind::Dir, 10, 2), &target, 2, 50).unwrap();
        assert_eq!(root.path, ".");
        assert_eq!(root.depth, 0);
        assert!(root.parent.is_none());

        let child = rebase(&node("/home/u/docs/a", NodeKind::File, 1, 3), &target, 2, 50).unwrap();
        assert_eq!(child.path, "a");
        assert_eq!(child.parent.as_deref(), Some("."));

        let deep = rebase(&node("/home/u/docs/a/b", NodeKind::File, 1, 4), &target, 2, 50).unwrap();
        assert_eq!(deep.path, "a/b");
        assert_eq!(deep.parent.as_deref(), Some("a"));
        assert_eq!(deep.depth, 2);
    }

    #[test]
    fn reroll_recomputes_top_row_from_children() {
        let target = Uri::parse("/a").unwrap();
        let mut rows = vec![
            rebase(&node("/a", NodeKind::Dir, 10, 0), &target, 0, 1).unwrap(),
            rebase(&node("/a/b", NodeKind::Dir, 3, 1), &target, 0, 1).unwrap(),
            rebase(&node("/a/c", NodeKind::File, 7, 1), &target, 0, 1).unwrap(),
        ];
        rows[1].size = 5; // patched child
        rows[1].n_desc = 12;

        reroll_root(&mut rows);
        let root = &rows[0];
        assert_eq!(root.size, 12);
        assert_eq!(root.n_children, 2);
        assert_eq!(root.n_desc, 2 + 12);
    }
}
