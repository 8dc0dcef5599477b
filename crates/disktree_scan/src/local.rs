//! Local filesystem probe.
//!
//! Depth-first walk reporting one entry per inode. File sizes are the
//! allocated size (block count x 512), not the logical length, so sparse
//! files are accounted by what they actually occupy on disk.

use crate::error::ProbeError;
use crate::probe::{Probe, ProbeOptions, ProbeSink};
use async_trait::async_trait;
use disktree_protocol::{NodeKind, RawEntry, Uri};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::debug;
use walkdir::WalkDir;

pub struct LocalProbe {
    options: ProbeOptions,
}

impl LocalProbe {
    pub fn new(options: ProbeOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Probe for LocalProbe {
    async fn run(&self, root: Uri, sink: ProbeSink) -> Result<(), ProbeError> {
        let options = self.options.clone();
        tokio::task::spawn_blocking(move || walk(&root, &options, &sink))
            .await
            .map_err(|e| ProbeError::Config(format!("probe task panicked: {e}")))?
    }
}

fn build_excludes(globs: &[String]) -> Result<GlobSet, ProbeError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in globs {
        let glob = Glob::new(pattern)
            .map_err(|e| ProbeError::Config(format!("bad exclude glob '{pattern}': {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| ProbeError::Config(e.to_string()))
}

fn walk(root: &Uri, options: &ProbeOptions, sink: &ProbeSink) -> Result<(), ProbeError> {
    let root_path = PathBuf::from(root.as_str());
    let excludes = build_excludes(&options.exclude_globs)?;

    // The root being unreadable is fatal; everything below is not.
    match std::fs::metadata(&root_path) {
        Ok(meta) if !meta.is_dir() && !meta.is_file() => {
            return Err(ProbeError::RootNotFound(format!(
                "{} is neither file nor directory",
                root_path.display()
            )))
        }
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ProbeError::RootNotFound(root_path.display().to_string()))
        }
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(ProbeError::RootPermission(root_path.display().to_string()))
        }
        Err(err) => return Err(err.into()),
    }

    let mut seen_inodes: HashSet<(u64, u64)> = HashSet::new();
    let walk_root = root_path.clone();
    let walker = WalkDir::new(&root_path)
        .follow_links(options.follow_symlinks)
        .into_iter()
        .filter_entry(move |entry| {
            entry.depth() == 0 || !matches_exclude(&excludes, &walk_root, entry.path())
        });

    let mut items = 0u64;
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let path = err
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                sink.path_error(path, err.to_string());
                continue;
            }
        };

        if entry.file_type().is_symlink() {
            // follow_links(false) surfaces the link itself; skip it
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(err) => {
                sink.path_error(entry.path().display().to_string(), err.to_string());
                continue;
            }
        };

        let kind = if metadata.is_dir() {
            NodeKind::Dir
        } else if metadata.is_file() {
            NodeKind::File
        } else {
            continue; // sockets, fifos, devices
        };

        if options.follow_symlinks && options.dedupe_by_inode {
            if !seen_inodes.insert(inode_key(&metadata)) {
                continue;
            }
        }

        let uri = match Uri::parse(&entry.path().to_string_lossy()) {
            Ok(uri) => uri,
            Err(err) => {
                sink.path_error(entry.path().display().to_string(), err.to_string());
                continue;
            }
        };

        sink.entry(RawEntry {
            uri,
            kind,
            size: match kind {
                NodeKind::File => allocated_size(&metadata),
                NodeKind::Dir => 0,
            },
            mtime: mtime_epoch(&metadata),
        });
        items += 1;
    }

    debug!(root = %root, items, "Local probe finished");
    Ok(())
}

fn matches_exclude(excludes: &GlobSet, root: &Path, path: &Path) -> bool {
    if excludes.is_empty() {
        return false;
    }
    let rel = path.strip_prefix(root).unwrap_or(path);
    excludes.is_match(rel)
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

#[cfg(unix)]
fn inode_key(metadata: &std::fs::Metadata) -> (u64, u64) {
    use std::os::unix::fs::MetadataExt;
    (metadata.dev(), metadata.ino())
}

#[cfg(not(unix))]
fn inode_key(_metadata: &std::fs::Metadata) -> (u64, u64) {
    (0, 0)
}

fn mtime_epoch(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{probe_channel, ProbeEvent};
    use std::fs;
    use tempfile::TempDir;

    async fn collect(root: &Uri, options: ProbeOptions) -> (Vec<RawEntry>, Vec<String>) {
        let (sink, mut rx) = probe_channel();
        let probe = LocalProbe::new(options);
        probe.run(root.clone(), sink).await.unwrap();

        let mut entries = Vec::new();
        let mut errors = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                ProbeEvent::Entry(e) => entries.push(e),
                ProbeEvent::PathError { path, .. } => errors.push(path),
            }
        }
        (entries, errors)
    }

    #[tokio::test]
    async fn reports_one_entry_per_inode() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.bin"), vec![0u8; 4096]).unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();
        fs::write(tmp.path().join("sub/b.bin"), b"hello").unwrap();

        let root = Uri::parse(&tmp.path().to_string_lossy()).unwrap();
        let (entries, errors) = collect(&root, ProbeOptions::default()).await;

        assert!(errors.is_empty());
        // root dir + a.bin + sub + sub/b.bin
        assert_eq!(entries.len(), 4);
        let files: Vec<_> = entries
            .iter()
            .filter(|e| e.kind == NodeKind::File)
            .collect();
        assert_eq!(files.len(), 2);
        // Allocated sizes are block-granular
        for file in files {
            assert_eq!(file.size % 512, 0);
        }
    }

    #[tokio::test]
    async fn exclude_globs_elide_subtrees() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("keep")).unwrap();
        fs::write(tmp.path().join("keep/x"), b"x").unwrap();
        fs::create_dir(tmp.path().join("node_modules")).unwrap();
        fs::write(tmp.path().join("node_modules/y"), b"y").unwrap();

        let root = Uri::parse(&tmp.path().to_string_lossy()).unwrap();
        let options = ProbeOptions {
            exclude_globs: vec!["node_modules".to_string()],
            ..Default::default()
        };
        let (entries, _) = collect(&root, options).await;

        assert!(entries
            .iter()
            .all(|e| !e.uri.as_str().contains("node_modules")));
        assert!(entries.iter().any(|e| e.uri.as_str().ends_with("keep/x")));
    }

    #[tokio::test]
    async fn missing_root_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let root = Uri::parse(&tmp.path().join("gone").to_string_lossy()).unwrap();

        let (sink, _rx) = probe_channel();
        let probe = LocalProbe::new(ProbeOptions::default());
        match probe.run(root, sink).await {
            Err(ProbeError::RootNotFound(_)) => {}
            other => panic!("expected RootNotFound, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unreadable_subtree_is_recorded_not_fatal() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("ok.bin"), b"fine").unwrap();
        let locked = tmp.path().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::write(locked.join("secret"), b"?").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        let root = Uri::parse(&tmp.path().to_string_lossy()).unwrap();
        let (entries, errors) = collect(&root, ProbeOptions::default()).await;

        // Restore so TempDir can clean up
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        if nix_is_root() {
            // Running as root ignores permission bits; nothing to assert
            return;
        }
        assert!(!errors.is_empty());
        assert!(entries.iter().any(|e| e.uri.as_str().ends_with("ok.bin")));
    }

    #[cfg(unix)]
    fn nix_is_root() -> bool {
        // SAFETY: geteuid has no preconditions
        unsafe { libc::geteuid() == 0 }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn sparse_file_reports_allocated_not_logical_size() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sparse.bin");
        let file = fs::File::create(&path).unwrap();
        file.set_len(1 << 30).unwrap(); // 1 GiB hole, nothing written

        let root = Uri::parse(&tmp.path().to_string_lossy()).unwrap();
        let (entries, _) = collect(&root, ProbeOptions::default()).await;

        let sparse = entries
            .iter()
            .find(|e| e.uri.as_str().ends_with("sparse.bin"))
            .unwrap();
        assert!(
            sparse.size < 1 << 20,
            "allocated size {} should be far below the 1 GiB logical length",
            sparse.size
        );
    }

    #[tokio::test]
    async fn mtime_is_reported_in_epoch_seconds() {
        use filetime::{set_file_mtime, FileTime};

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("old.bin");
        fs::write(&path, b"x").unwrap();
        set_file_mtime(&path, FileTime::from_unix_time(1_500_000_000, 0)).unwrap();

        let root = Uri::parse(&tmp.path().to_string_lossy()).unwrap();
        let (entries, _) = collect(&root, ProbeOptions::default()).await;

        let old = entries
            .iter()
            .find(|e| e.uri.as_str().ends_with("old.bin"))
            .unwrap();
        assert_eq!(old.mtime, 1_500_000_000);
    }

    #[tokio::test]
    async fn symlinks_are_skipped_by_default() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("real"), b"data").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(tmp.path().join("real"), tmp.path().join("link")).unwrap();

        let root = Uri::parse(&tmp.path().to_string_lossy()).unwrap();
        let (entries, _) = collect(&root, ProbeOptions::default()).await;

        assert!(entries.iter().all(|e| !e.uri.as_str().ends_with("link")));
    }
}
