//! Planner integration tests: ancestor resolution, re-rooting,
//! fresher-child patching, and compare.

use disktree::{Config, Disktree};
use disktree_blob::BlobStore;
use disktree_catalog::{Catalog, NewScan};
use disktree_protocol::{NodeKind, RawEntry, ScanStatus, Scanned, Uri};
use disktree_scan::aggregate::build_snapshot;
use std::path::PathBuf;
use tempfile::TempDir;

struct TestEnv {
    _temp: TempDir,
    root_dir: PathBuf,
}

impl TestEnv {
    fn new() -> Self {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let root_dir = temp.path().to_path_buf();
        Self {
            _temp: temp,
            root_dir,
        }
    }

    fn config(&self) -> Config {
        Config::at_root(&self.root_dir)
    }

    /// Seed a completed scan: aggregate entries into a snapshot, write the
    /// blob, insert the catalog row. Exactly what a worker commits.
    async fn seed_scan(&self, root: &str, completed_at: i64, entries: Vec<RawEntry>) -> i64 {
        let config = self.config();
        let catalog = Catalog::open(config.db_path()).await.unwrap();
        let blobs = BlobStore::new(config.blob_dir()).unwrap();

        let root = Uri::parse(root).unwrap();
        let snapshot = build_snapshot(root.clone(), completed_at, 0, Vec::new(), entries);
        let root_node = snapshot.nodes.first().cloned().unwrap();
        let blob_id = blobs.put(&snapshot).unwrap();

        catalog
            .insert_scan(&NewScan {
                root_uri: root,
                completed_at,
                blob_id: blob_id.to_string(),
                root_size: root_node.size,
                root_n_children: root_node.n_children,
                root_n_desc: root_node.n_desc,
                error_count: 0,
                error_paths: Vec::new(),
            })
            .await
            .unwrap()
    }

    async fn service(&self) -> Disktree {
        Disktree::open(self.config()).await.unwrap()
    }
}

fn file(uri: &str, size: u64, mtime: i64) -> RawEntry {
    RawEntry {
        uri: Uri::parse(uri).unwrap(),
        kind: NodeKind::File,
        size,
        mtime,
    }
}

// ============================================================================
// view
// ============================================================================

#[tokio::test]
async fn view_with_no_scans_returns_none() {
    let env = TestEnv::new();
    let service = env.service().await;

    let view = service.view("/", 2, None).await.unwrap();
    assert_eq!(view.status, ScanStatus::None);
    assert!(view.root.is_none());
    assert!(view.rows.is_empty());
}

#[tokio::test]
async fn view_of_path_absent_from_ancestor_returns_none() {
    let env = TestEnv::new();
    env.seed_scan("/A", 100, vec![file("/A/x.bin", 10, 50)]).await;
    let service = env.service().await;

    let view = service.view("/A/created-later", 2, None).await.unwrap();
    assert_eq!(view.status, ScanStatus::None);
}

#[tokio::test]
async fn exact_scan_without_patches_is_full() {
    let env = TestEnv::new();
    env.seed_scan(
        "/A",
        100,
        vec![file("/A/x.bin", 10, 50), file("/A/sub/y.bin", 4, 60)],
    )
    .await;
    let service = env.service().await;

    let view = service.view("/A", 2, None).await.unwrap();
    assert_eq!(view.status, ScanStatus::Full);

    let root = view.root.unwrap();
    assert_eq!(root.size, 14);
    assert_eq!(root.n_desc, 3);
    assert_eq!(root.path, ".");
    assert_eq!(view.children.len(), 2);
    // Largest first
    assert_eq!(view.children[0].path, "x.bin");
    assert_eq!(view.scan_root, Some(Uri::parse("/A").unwrap()));
}

/// Seed case: scan /A at t=100 (size 10, n_desc 9, child B size 3), then
/// scan /A/B at t=200 (size 5, n_desc 12). The view of /A patches B and
/// re-rolls the root: 10 - 3 + 5 = 12.
#[tokio::test]
async fn fresher_child_patch_rerolls_root_aggregates() {
    let env = TestEnv::new();

    // /A: child dir B (one file of 3) + 7 loose files of 1 each
    // => size 10, children 8, n_desc 8 + 1 = 9
    let mut entries = vec![file("/A/B/f0.bin", 3, 10)];
    for i in 0..7 {
        entries.push(file(&format!("/A/c{i}.bin"), 1, 10));
    }
    let old_id = env.seed_scan("/A", 100, entries).await;

    // /A/B rescanned later: 12 files summing 5
    let mut b_entries = Vec::new();
    for i in 0..12 {
        let size = if i < 5 { 1 } else { 0 };
        b_entries.push(file(&format!("/A/B/g{i}.bin"), size, 20));
    }
    env.seed_scan("/A/B", 200, b_entries).await;

    let service = env.service().await;
    let view = service.view("/A", 1, None).await.unwrap();

    assert_eq!(view.status, ScanStatus::Partial);
    assert_eq!(view.scan_id, Some(old_id));

    let root = view.root.unwrap();
    assert_eq!(root.size, 12, "10 - 3 + 5");
    assert_eq!(root.n_children, 8);
    assert_eq!(root.n_desc, 8 + 12, "patched B contributes 12 descendants");

    let b = view.children.iter().find(|c| c.path == "B").unwrap();
    assert_eq!(b.scanned, Scanned::Yes);
    assert_eq!(b.size, 5);
    assert_eq!(b.n_desc, 12);
    assert_eq!(b.scan_time, Some(200));

    // Unpatched siblings keep the ancestor's aggregates and scan time
    let c0 = view.children.iter().find(|c| c.path == "c0.bin").unwrap();
    assert_eq!(c0.size, 1);
    assert_eq!(c0.scan_time, Some(100));
}

/// Patch monotonicity: only the patched child's aggregates move.
#[tokio::test]
async fn patch_touches_only_the_fresher_child() {
    let env = TestEnv::new();
    env.seed_scan(
        "/A",
        100,
        vec![file("/A/B/x.bin", 3, 10), file("/A/C/y.bin", 4, 10)],
    )
    .await;
    env.seed_scan("/A/B", 200, vec![file("/A/B/x.bin", 9, 20)]).await;

    let service = env.service().await;
    let view = service.view("/A", 1, None).await.unwrap();

    let b = view.children.iter().find(|c| c.path == "B").unwrap();
    let c = view.children.iter().find(|c| c.path == "C").unwrap();
    assert_eq!(b.size, 9);
    assert_eq!(c.size, 4, "untouched sibling");
    assert_eq!(view.root.unwrap().size, 13);
}

/// A fresher scan deeper than depth 1 marks the enclosing child partial
/// instead of patching through it.
#[tokio::test]
async fn deep_fresher_scan_marks_enclosing_child_partial() {
    let env = TestEnv::new();
    env.seed_scan("/A", 100, vec![file("/A/B/deep/x.bin", 3, 10)]).await;
    env.seed_scan("/A/B/deep", 200, vec![file("/A/B/deep/x.bin", 30, 20)]).await;

    let service = env.service().await;
    let view = service.view("/A", 1, None).await.unwrap();

    assert_eq!(view.status, ScanStatus::Partial);
    let b = view.children.iter().find(|c| c.path == "B").unwrap();
    assert_eq!(b.scanned, Scanned::Partial);
    // Single-level patching: aggregates are not propagated through
    assert_eq!(b.size, 3);
}

/// Seed case: scan /home/u, then view a subdirectory. The planner selects
/// the ancestor and re-roots at docs.
#[tokio::test]
async fn ancestor_slice_is_rerooted_at_the_target() {
    let env = TestEnv::new();
    env.seed_scan(
        "/home/u",
        100,
        vec![
            file("/home/u/docs/tax/2024.pdf", 5, 10),
            file("/home/u/docs/cv.pdf", 2, 11),
            file("/home/u/music/a.mp3", 99, 12),
        ],
    )
    .await;

    let service = env.service().await;
    let view = service.view("/home/u/docs", 2, None).await.unwrap();

    assert_eq!(view.status, ScanStatus::Partial);
    assert_eq!(view.scan_root, Some(Uri::parse("/home/u").unwrap()));

    let root = view.root.unwrap();
    assert_eq!(root.path, ".");
    assert_eq!(root.size, 7);
    assert_eq!(root.n_desc, 3);

    let paths: Vec<&str> = view.rows.iter().map(|r| r.path.as_str()).collect();
    assert!(paths.contains(&"tax"));
    assert!(paths.contains(&"cv.pdf"));
    assert!(paths.contains(&"tax/2024.pdf"));
    assert!(!paths.iter().any(|p| p.contains("music")));

    let deep = view.rows.iter().find(|r| r.path == "tax/2024.pdf").unwrap();
    assert_eq!(deep.parent.as_deref(), Some("tax"));
    assert_eq!(deep.depth, 2);
}

#[tokio::test]
async fn view_is_idempotent_without_writes() {
    let env = TestEnv::new();
    env.seed_scan(
        "/A",
        100,
        vec![file("/A/B/x.bin", 3, 10), file("/A/y.bin", 1, 11)],
    )
    .await;
    env.seed_scan("/A/B", 200, vec![file("/A/B/x.bin", 5, 20)]).await;

    let service = env.service().await;
    let first = service.view("/A", 2, None).await.unwrap();
    let second = service.view("/A", 2, None).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn most_recent_covering_scan_wins() {
    let env = TestEnv::new();
    env.seed_scan("/A", 100, vec![file("/A/x.bin", 1, 10)]).await;
    let newer = env.seed_scan("/A", 300, vec![file("/A/x.bin", 2, 30)]).await;

    let service = env.service().await;
    let view = service.view("/A", 1, None).await.unwrap();
    assert_eq!(view.scan_id, Some(newer));
    assert_eq!(view.root.unwrap().size, 2);
}

// ============================================================================
// compare
// ============================================================================

/// Seed case: a(10), b(20) vs b(20), c(5) yields removed/unchanged/added
/// and a total delta of -5.
#[tokio::test]
async fn compare_reports_added_removed_unchanged() {
    let env = TestEnv::new();
    let scan_a = env
        .seed_scan(
            "/X",
            100,
            vec![file("/X/a/f.bin", 10, 10), file("/X/b/f.bin", 20, 10)],
        )
        .await;
    let scan_b = env
        .seed_scan(
            "/X",
            200,
            vec![file("/X/b/f.bin", 20, 10), file("/X/c/f.bin", 5, 20)],
        )
        .await;

    let service = env.service().await;
    let cmp = service.compare("/X", scan_a, scan_b, None).await.unwrap();

    assert_eq!(cmp.total_delta, -5);
    assert_eq!(cmp.rows.len(), 3);

    let a = cmp.rows.iter().find(|r| r.path == "a").unwrap();
    assert_eq!(a.status, disktree_protocol::CompareStatus::Removed);
    assert_eq!(a.size_delta, -10);

    let b = cmp.rows.iter().find(|r| r.path == "b").unwrap();
    assert_eq!(b.status, disktree_protocol::CompareStatus::Unchanged);
    assert_eq!(b.size_delta, 0);

    let c = cmp.rows.iter().find(|r| r.path == "c").unwrap();
    assert_eq!(c.status, disktree_protocol::CompareStatus::Added);
    assert_eq!(c.size_delta, 5);
}

#[tokio::test]
async fn compare_slices_deeper_ancestor_scans() {
    let env = TestEnv::new();
    let scan_a = env
        .seed_scan("/home", 100, vec![file("/home/u/docs/a.pdf", 10, 10)])
        .await;
    let scan_b = env
        .seed_scan("/home", 200, vec![file("/home/u/docs/a.pdf", 25, 20)])
        .await;

    let service = env.service().await;
    let cmp = service
        .compare("/home/u/docs", scan_a, scan_b, None)
        .await
        .unwrap();

    assert_eq!(cmp.rows.len(), 1);
    assert_eq!(cmp.rows[0].path, "a.pdf");
    assert_eq!(cmp.rows[0].status, disktree_protocol::CompareStatus::Changed);
    assert_eq!(cmp.total_delta, 15);
}

#[tokio::test]
async fn compare_rejects_scans_that_do_not_cover_the_uri() {
    let env = TestEnv::new();
    let scan_a = env.seed_scan("/X", 100, vec![file("/X/a.bin", 1, 1)]).await;
    let scan_b = env.seed_scan("/Y", 200, vec![file("/Y/b.bin", 1, 1)]).await;

    let service = env.service().await;
    let err = service.compare("/X", scan_a, scan_b, None).await.unwrap_err();
    assert_eq!(err.kind, disktree_protocol::ErrorKind::NotFound);
}

// ============================================================================
// listing and history
// ============================================================================

#[tokio::test]
async fn list_scans_is_latest_per_root_without_opening_blobs() {
    let env = TestEnv::new();
    env.seed_scan("/A", 100, vec![file("/A/x.bin", 1, 1)]).await;
    env.seed_scan("/A", 200, vec![file("/A/x.bin", 2, 2)]).await;
    env.seed_scan("/B", 150, vec![file("/B/y.bin", 3, 3)]).await;

    let service = env.service().await;
    let scans = service.list_scans().await.unwrap();
    assert_eq!(scans.len(), 2);
    assert_eq!(scans[0].root_uri, Uri::parse("/A").unwrap());
    assert_eq!(scans[0].completed_at, 200);
    assert_eq!(scans[0].root_size, 2);

    let history = service.history("/A/x.bin").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].completed_at, 200);
}
