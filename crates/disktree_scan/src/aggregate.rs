//! Folding a probe's entry stream into a tree snapshot.
//!
//! The stream carries no ordering guarantee (parallel local walks and
//! object listings both arrive out of order), so entries are buffered in a
//! map, missing directories are synthesized from URI prefixes, and rollups
//! run bottom-up by descending depth. The emitted node list is sorted by
//! `(depth, uri)`, which is what lets the blob writer build a depth index.

use disktree_protocol::{Node, NodeKind, RawEntry, Snapshot, Uri};
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Clone)]
struct BuildNode {
    kind: NodeKind,
    size: u64,
    mtime: i64,
    n_children: u32,
    n_desc: u64,
}

impl BuildNode {
    fn dir(mtime: i64) -> Self {
        Self {
            kind: NodeKind::Dir,
            size: 0,
            mtime,
            n_children: 0,
            n_desc: 0,
        }
    }
}

/// Fold raw entries into rollup-consistent nodes rooted at `root_uri`.
///
/// Entries outside the root are dropped with a warning. The root itself is
/// synthesized as a directory when the probe did not report it.
pub fn aggregate(root_uri: &Uri, entries: Vec<RawEntry>) -> Vec<Node> {
    let mut map: HashMap<Uri, BuildNode> = HashMap::new();

    for entry in entries {
        if entry.uri.depth_below(root_uri).is_none() {
            warn!(uri = %entry.uri, root = %root_uri, "Entry outside scan root, dropped");
            continue;
        }

        match entry.kind {
            NodeKind::Dir => {
                map.entry(entry.uri.clone())
                    .and_modify(|n| n.mtime = n.mtime.max(entry.mtime))
                    .or_insert_with(|| BuildNode::dir(entry.mtime));
            }
            NodeKind::File => {
                map.insert(
                    entry.uri.clone(),
                    BuildNode {
                        kind: NodeKind::File,
                        size: entry.size,
                        mtime: entry.mtime,
                        n_children: 0,
                        n_desc: 0,
                    },
                );
            }
        }

        // Synthesize any ancestors the probe never reported (object keys,
        // or dirs raced away mid-walk)
        let mut cur = entry.uri;
        while &cur != root_uri {
            let Some(parent) = cur.parent() else { break };
            if map.contains_key(&parent) {
                break;
            }
            map.insert(parent.clone(), BuildNode::dir(0));
            cur = parent;
        }
    }

    map.entry(root_uri.clone()).or_insert_with(|| BuildNode::dir(0));

    // Bottom-up rollups: children are final before their parent is touched
    let mut ordered: Vec<(Uri, u32)> = map
        .keys()
        .filter_map(|u| u.depth_below(root_uri).map(|d| (u.clone(), d)))
        .collect();
    ordered.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    for (uri, depth) in &ordered {
        if *depth == 0 {
            continue;
        }
        let Some(child) = map.get(uri).cloned() else { continue };
        let Some(parent_uri) = uri.parent() else { continue };
        if let Some(parent) = map.get_mut(&parent_uri) {
            parent.size += child.size;
            parent.n_children += 1;
            parent.n_desc += child.n_desc + 1;
            parent.mtime = parent.mtime.max(child.mtime);
        }
    }

    let mut nodes: Vec<Node> = ordered
        .into_iter()
        .map(|(uri, depth)| {
            let build = &map[&uri];
            Node {
                parent: if depth == 0 { None } else { uri.parent() },
                uri,
                kind: build.kind,
                size: build.size,
                mtime: build.mtime,
                depth,
                n_children: build.n_children,
                n_desc: build.n_desc,
            }
        })
        .collect();
    nodes.sort_by(|a, b| a.depth.cmp(&b.depth).then_with(|| a.uri.cmp(&b.uri)));
    nodes
}

/// Aggregate and wrap into a [`Snapshot`].
pub fn build_snapshot(
    root_uri: Uri,
    completed_at: i64,
    error_count: u64,
    error_paths: Vec<String>,
    entries: Vec<RawEntry>,
) -> Snapshot {
    let nodes = aggregate(&root_uri, entries);
    Snapshot {
        root_uri,
        completed_at,
        error_count,
        error_paths,
        nodes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> Uri {
        Uri::parse(s).unwrap()
    }

    fn file(u: &str, size: u64, mtime: i64) -> RawEntry {
        RawEntry {
            uri: uri(u),
            kind: NodeKind::File,
            size,
            mtime,
        }
    }

    fn dir(u: &str, mtime: i64) -> RawEntry {
        RawEntry {
            uri: uri(u),
            kind: NodeKind::Dir,
            size: 0,
            mtime,
        }
    }

    fn by_uri<'a>(nodes: &'a [Node], u: &str) -> &'a Node {
        nodes
            .iter()
            .find(|n| n.uri.as_str() == u)
            .unwrap_or_else(|| panic!("missing node {u}"))
    }

    /// Rollup invariants from the data model: dir size sums children, dir
    /// mtime is the max child mtime, n_desc counts everything strictly
    /// below, and every non-root node's parent exists.
    fn assert_invariants(nodes: &[Node]) {
        let index: HashMap<&Uri, &Node> = nodes.iter().map(|n| (&n.uri, n)).collect();
        let roots: Vec<_> = nodes.iter().filter(|n| n.depth == 0).collect();
        assert_eq!(roots.len(), 1, "exactly one root");
        assert!(roots[0].parent.is_none());

        for node in nodes {
            if node.depth > 0 {
                let parent = node.parent.as_ref().expect("non-root has parent");
                assert!(index.contains_key(parent), "parent of {} exists", node.uri);
            }
            if node.kind == NodeKind::Dir {
                let children: Vec<_> = nodes
                    .iter()
                    .filter(|c| c.parent.as_ref() == Some(&node.uri))
                    .collect();
                assert_eq!(node.n_children as usize, children.len());
                assert_eq!(node.size, children.iter().map(|c| c.size).sum::<u64>());
                assert_eq!(
                    node.n_desc,
                    node.n_children as u64 + children.iter().map(|c| c.n_desc).sum::<u64>()
                );
                if !children.is_empty() {
                    assert_eq!(
                        node.mtime,
                        children.iter().map(|c| c.mtime).max().unwrap_or(0)
                    );
                }
            } else {
                assert_eq!(node.n_children, 0);
                assert_eq!(node.n_desc, 0);
            }
        }
    }

    #[test]
    fn rollups_hold_over_unordered_input() {
        let root = uri("/data");
        // Deliberately shuffled: children before parents, dirs interleaved
        let entries = vec![
            file("/data/a/deep/x.bin", 100, 50),
            dir("/data/a", 10),
            file("/data/b.bin", 7, 99),
            dir("/data", 5),
            dir("/data/a/deep", 20),
            file("/data/a/y.bin", 3, 60),
        ];

        let nodes = aggregate(&root, entries);
        assert_invariants(&nodes);

        let root_node = by_uri(&nodes, "/data");
        assert_eq!(root_node.size, 110);
        assert_eq!(root_node.n_desc, 5);
        assert_eq!(root_node.n_children, 2);
        assert_eq!(root_node.mtime, 99);

        let a = by_uri(&nodes, "/data/a");
        assert_eq!(a.size, 103);
        assert_eq!(a.n_desc, 3);
        assert_eq!(a.mtime, 60);
    }

    #[test]
    fn synthesizes_directories_from_object_keys() {
        let root = uri("s3://bkt/logs");
        let entries = vec![
            file("s3://bkt/logs/2024/01/a.gz", 10, 100),
            file("s3://bkt/logs/2024/01/b.gz", 20, 200),
            file("s3://bkt/logs/2024/02/c.gz", 30, 300),
        ];

        let nodes = aggregate(&root, entries);
        assert_invariants(&nodes);

        assert_eq!(by_uri(&nodes, "s3://bkt/logs").size, 60);
        assert_eq!(by_uri(&nodes, "s3://bkt/logs/2024").n_children, 2);
        assert_eq!(by_uri(&nodes, "s3://bkt/logs/2024/01").size, 30);
        assert_eq!(by_uri(&nodes, "s3://bkt/logs/2024").mtime, 300);
    }

    #[test]
    fn empty_dir_keeps_its_own_mtime() {
        let root = uri("/data");
        let nodes = aggregate(&root, vec![dir("/data", 5), dir("/data/empty", 42)]);
        assert_invariants(&nodes);

        let empty = by_uri(&nodes, "/data/empty");
        assert_eq!(empty.size, 0);
        assert_eq!(empty.n_desc, 0);
        assert_eq!(empty.mtime, 42);
        // Parent mtime still folds the child dir in
        assert_eq!(by_uri(&nodes, "/data").mtime, 42);
    }

    #[test]
    fn root_only_stream_yields_single_node() {
        let root = uri("/data");
        let nodes = aggregate(&root, vec![dir("/data", 9)]);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].depth, 0);
        assert!(nodes[0].parent.is_none());
    }

    #[test]
    fn entries_outside_root_are_dropped() {
        let root = uri("/data");
        let nodes = aggregate(
            &root,
            vec![file("/elsewhere/x", 100, 1), file("/data/a", 5, 1)],
        );
        assert_invariants(&nodes);
        assert_eq!(by_uri(&nodes, "/data").size, 5);
        assert!(nodes.iter().all(|n| n.uri.as_str() != "/elsewhere/x"));
    }

    #[test]
    fn output_is_depth_sorted_for_the_blob_writer() {
        let root = uri("/data");
        let entries = vec![
            file("/data/z/1", 1, 1),
            file("/data/a/2", 1, 1),
            file("/data/m", 1, 1),
        ];
        let nodes = aggregate(&root, entries);
        let mut last = (0u32, String::new());
        for node in &nodes {
            let key = (node.depth, node.uri.as_str().to_string());
            assert!(key >= last, "not sorted at {}", node.uri);
            last = key;
        }
    }
}
