//! The worker pipeline: Probe -> Aggregator -> BlobStore -> Catalog.
//!
//! Commit order matters: the blob is written first and the catalog row
//! last, so a reader never observes a scan row without its blob. A blob
//! orphaned by a failed catalog commit is swept by GC.

use crate::aggregate::build_snapshot;
use crate::error::{Result, ScanError};
use crate::probe::{probe_channel, probe_for, ProbeEvent, ProbeOptions};
use disktree_blob::BlobStore;
use disktree_catalog::{Catalog, NewScan};
use disktree_protocol::wire::{ProgressWire, WireFrame};
use disktree_protocol::{ProgressStatus, RawEntry, Uri};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{error, info};

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub root: Uri,
    pub db_path: PathBuf,
    pub blob_dir: PathBuf,
    pub probe: ProbeOptions,
    /// Cap on sampled unreadable paths recorded in the scan row.
    pub sample_error_paths: usize,
    /// Progress is persisted/emitted every tick...
    pub progress_tick: Duration,
    /// ...or every this many items, whichever comes first.
    pub progress_items_interval: u64,
}

#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub scan_id: i64,
    pub items_found: u64,
    pub error_count: u64,
    pub duration_ms: u64,
}

/// Run one scan to completion, reporting progress through `on_frame`.
pub async fn run_scan(
    options: ScanOptions,
    mut on_frame: impl FnMut(WireFrame),
) -> Result<ScanOutcome> {
    let start = Instant::now();

    let catalog = Catalog::open(&options.db_path).await?;
    let blobs = BlobStore::new(&options.blob_dir)?;

    let progress_id = catalog
        .progress_start(&options.root, std::process::id() as i64)
        .await?;

    let (sink, mut rx) = probe_channel();
    let probe = probe_for(&options.root, options.probe.clone());
    let probe_root = options.root.clone();
    let probe_task = tokio::spawn(async move { probe.run(probe_root, sink).await });

    let mut entries: Vec<RawEntry> = Vec::new();
    let mut error_count = 0u64;
    let mut error_paths: Vec<String> = Vec::new();
    let mut last_emit = Instant::now();
    let mut last_emit_items = 0u64;

    while let Some(event) = rx.recv().await {
        match event {
            ProbeEvent::Entry(entry) => entries.push(entry),
            ProbeEvent::PathError { path, message } => {
                error_count += 1;
                if error_paths.len() < options.sample_error_paths {
                    error_paths.push(path.clone());
                }
                on_frame(WireFrame::PathError(
                    disktree_protocol::wire::PathErrorWire { path, message },
                ));
            }
        }

        let items = entries.len() as u64;
        let due_by_items = items >= last_emit_items + options.progress_items_interval;
        let due_by_time = last_emit.elapsed() >= options.progress_tick;
        if due_by_items || due_by_time {
            last_emit = Instant::now();
            last_emit_items = items;
            let items_per_sec = rate(items, start.elapsed());
            on_frame(WireFrame::Progress(ProgressWire {
                items_found: items,
                error_count,
                items_per_sec,
            }));
            catalog
                .progress_update(progress_id, items, error_count, items_per_sec)
                .await?;
        }
    }

    let probe_result = probe_task
        .await
        .map_err(|e| ScanError::Probe(crate::ProbeError::Config(format!("probe join: {e}"))))?;
    if let Err(probe_err) = probe_result {
        error!(root = %options.root, error = %probe_err, "Probe failed");
        catalog
            .progress_finish(progress_id, ProgressStatus::Failed)
            .await?;
        return Err(probe_err.into());
    }

    let items_found = entries.len() as u64;
    let completed_at = Catalog::now();
    let snapshot = build_snapshot(
        options.root.clone(),
        completed_at,
        error_count,
        error_paths.clone(),
        entries,
    );

    let root_node = snapshot
        .nodes
        .first()
        .cloned()
        .ok_or_else(|| ScanError::Blob(disktree_blob::BlobError::invalid("empty snapshot")))?;

    // Blob first; catalog row last
    let blob_id = match blobs.put(&snapshot) {
        Ok(id) => id,
        Err(err) => {
            catalog
                .progress_finish(progress_id, ProgressStatus::Failed)
                .await?;
            return Err(err.into());
        }
    };
    let scan_id = match catalog
        .insert_scan(&NewScan {
            root_uri: options.root.clone(),
            completed_at,
            blob_id: blob_id.to_string(),
            root_size: root_node.size,
            root_n_children: root_node.n_children,
            root_n_desc: root_node.n_desc,
            error_count,
            error_paths,
        })
        .await
    {
        Ok(id) => id,
        Err(err) => {
            // Orphaned blob is GC-eligible; don't try to be clever here
            error!(blob_id = %blob_id, error = %err, "Catalog commit failed");
            catalog
                .progress_finish(progress_id, ProgressStatus::Failed)
                .await?;
            return Err(err.into());
        }
    };

    catalog.progress_delete(progress_id).await?;

    let duration_ms = start.elapsed().as_millis() as u64;
    info!(
        root = %options.root,
        scan_id,
        items_found,
        error_count,
        duration_ms,
        "Scan committed"
    );

    Ok(ScanOutcome {
        scan_id,
        items_found,
        error_count,
        duration_ms,
    })
}

fn rate(items: u64, elapsed: Duration) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return None;
    }
    Some(items as f64 / secs)
}
