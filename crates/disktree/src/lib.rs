//! disktree - disk-space indexing and query engine.
//!
//! Indexes disk usage across local filesystems and object-store buckets
//! into immutable columnar snapshots, and answers interactive queries over
//! them without rescanning: re-rooted views with fresher-child patching,
//! scan history, compare, and delete-with-repair.
//!
//! [`Disktree`] is the embedding surface consumed by the HTTP layer and
//! the CLI; every operation returns an [`ApiError`] carrying a taxonomy
//! kind plus a human message.

pub mod config;
mod error;
mod mutator;
mod planner;
mod scheduler;

pub use config::Config;
pub use error::{ApiError, Result};
pub use scheduler::ProgressStream;

use disktree_blob::{BlobId, BlobStore};
use disktree_catalog::Catalog;
use disktree_protocol::{
    Comparison, DeleteResult, Job, ScanProgressRow, ScanRecord, Uri, View,
};
use mutator::Mutator;
use planner::Planner;
use scheduler::Scheduler;
use serde::Serialize;
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Default, Serialize)]
pub struct GcStats {
    pub scans_deleted: u64,
    pub blobs_deleted: u64,
}

/// The assembled service: catalog + blob store + scheduler.
pub struct Disktree {
    config: Config,
    catalog: Catalog,
    blobs: BlobStore,
    scheduler: Scheduler,
}

impl Disktree {
    /// Open (creating as needed) the service rooted at `config.root_dir`.
    pub async fn open(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.root_dir)
            .map_err(|e| ApiError::internal(format!("cannot create root dir: {e}")))?;

        let catalog = Catalog::open(config.db_path()).await?;
        let blobs = BlobStore::new(config.blob_dir())?;
        let scheduler = Scheduler::new(catalog.clone(), config.clone()).await?;

        Ok(Self {
            config,
            catalog,
            blobs,
            scheduler,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Most recent scan per root.
    pub async fn list_scans(&self) -> Result<Vec<ScanRecord>> {
        Ok(self.catalog.latest_per_root().await?)
    }

    /// What do I know about `uri`? See [`planner`] for the algorithm.
    pub async fn view(&self, uri: &str, depth: u32, deadline: Option<Duration>) -> Result<View> {
        let uri = Uri::parse(uri)?;
        let planner = Planner::new(&self.catalog, &self.blobs);
        with_deadline(deadline, planner.view(&uri, depth)).await
    }

    /// Scan history covering `uri` (its own scans and every ancestor's).
    pub async fn history(&self, uri: &str) -> Result<Vec<ScanRecord>> {
        let uri = Uri::parse(uri)?;
        Ok(self.catalog.history_for(&uri).await?)
    }

    /// Row-per-child diff of `uri` between two scans.
    pub async fn compare(
        &self,
        uri: &str,
        scan_a: i64,
        scan_b: i64,
        deadline: Option<Duration>,
    ) -> Result<Comparison> {
        let uri = Uri::parse(uri)?;
        let planner = Planner::new(&self.catalog, &self.blobs);
        with_deadline(deadline, planner.compare(&uri, scan_a, scan_b)).await
    }

    /// Start (or coalesce into) a scan of `uri`.
    pub fn start_scan(&self, uri: &str) -> Result<Job> {
        let uri = Uri::parse(uri)?;
        self.scheduler.start(uri)
    }

    pub fn scan_status(&self, job_id: &str) -> Result<Job> {
        self.scheduler
            .status(job_id)
            .ok_or_else(|| ApiError::not_found(format!("No job {job_id}")))
    }

    pub fn running_scans(&self) -> Vec<Job> {
        self.scheduler.running()
    }

    /// Persisted progress rows (what a fresh SSE subscriber sees first).
    pub async fn progress_rows(&self) -> Result<Vec<ScanProgressRow>> {
        Ok(self.catalog.progress_running().await?)
    }

    /// Live progress stream; lag is surfaced, never back-pressured.
    pub fn subscribe_progress(&self) -> ProgressStream {
        self.scheduler.subscribe()
    }

    pub fn cancel_scan(&self, job_id: &str) -> Result<Job> {
        self.scheduler.cancel(job_id)
    }

    /// Delete a local path and repair affected snapshots. Serializes with
    /// scans through the scan registry: an overlapping active scan rejects
    /// the delete.
    pub async fn delete(&self, uri: &str) -> Result<DeleteResult> {
        let uri = Uri::parse(uri)?;
        if self.scheduler.has_overlapping_scan(&uri) {
            return Err(ApiError::conflict(format!(
                "a scan overlapping {uri} is in progress"
            )));
        }
        Mutator::new(&self.catalog, &self.blobs).delete(&uri).await
    }

    /// Buckets visible to the configured object-store credentials.
    pub async fn list_buckets(&self) -> Result<Vec<String>> {
        Ok(disktree_scan::object::list_buckets().await?)
    }

    /// Evict superseded snapshots outside the retention window, then sweep
    /// orphaned blobs (skipped while scans are active, since a worker
    /// writes its blob before its catalog row).
    pub async fn gc(&self) -> Result<GcStats> {
        let mut stats = GcStats::default();

        let cutoff = Catalog::now() - self.config.retention_secs;
        for record in self.catalog.gc_candidates(cutoff).await? {
            self.catalog.delete_scan(record.id).await?;
            if let Ok(blob_id) = BlobId::from_str(&record.blob_id) {
                let _ = self.blobs.delete(&blob_id);
            }
            stats.scans_deleted += 1;
            stats.blobs_deleted += 1;
        }

        if self.scheduler.running().is_empty() {
            let referenced: HashSet<String> =
                self.catalog.referenced_blob_ids().await?.into_iter().collect();
            for blob_id in self.blobs.list()? {
                if !referenced.contains(blob_id.as_str()) {
                    self.blobs.delete(&blob_id)?;
                    stats.blobs_deleted += 1;
                }
            }
        }

        info!(
            scans = stats.scans_deleted,
            blobs = stats.blobs_deleted,
            "GC finished"
        );
        Ok(stats)
    }

    /// Cancel running scans and release the catalog.
    pub async fn shutdown(self) {
        self.scheduler.shutdown();
        self.catalog.close().await;
    }
}

async fn with_deadline<T>(
    deadline: Option<Duration>,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match deadline {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| ApiError::aborted(format!("deadline of {limit:?} expired")))?,
        None => fut.await,
    }
}
