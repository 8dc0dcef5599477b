//! Scan scheduler: supervises worker subprocesses, streams progress, and
//! enforces the one-active-scan-per-root invariant.
//!
//! Each job runs `disktree-scan` as a child process (memory isolation,
//! signal-based cancellation). A supervisor task per job decodes wire
//! frames off the child's stdout, updates the in-memory job table, and
//! republishes monotone progress frames to broadcast subscribers. Slow
//! subscribers are dropped by the bounded channel and observe a `lagged`
//! marker rather than ever blocking a worker.

use crate::config::Config;
use crate::error::{ApiError, Result};
use disktree_catalog::Catalog;
use disktree_protocol::wire::{read_frame_async, WireFrame};
use disktree_protocol::{ErrorKind, Job, JobState, ProgressFrame, Scheme, Uri};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tokio::sync::{broadcast, oneshot};
use tracing::{info, warn};

const PROGRESS_CHANNEL_CAPACITY: usize = 256;

pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    catalog: Catalog,
    config: Config,
    worker_bin: PathBuf,
    table: Mutex<JobTable>,
    progress_tx: broadcast::Sender<ProgressFrame>,
}

#[derive(Default)]
struct JobTable {
    jobs: HashMap<String, JobEntry>,
    /// The scan registry: one active job per root. Held only while
    /// starting and terminating jobs, never across a scan.
    active: HashMap<Uri, String>,
    pending: VecDeque<String>,
    running: usize,
}

struct JobEntry {
    job: Job,
    cancel: Option<oneshot::Sender<()>>,
}

/// Subscriber handle that converts broadcast lag into a `lagged` marker on
/// the next delivered frame instead of an error.
pub struct ProgressStream {
    rx: broadcast::Receiver<ProgressFrame>,
}

impl ProgressStream {
    /// Next frame, or `None` once the scheduler shuts down.
    pub async fn recv(&mut self) -> Option<ProgressFrame> {
        let mut lagged = false;
        loop {
            match self.rx.recv().await {
                Ok(mut frame) => {
                    frame.lagged = lagged;
                    return Some(frame);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Progress subscriber lagged");
                    lagged = true;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Scheduler {
    pub async fn new(catalog: Catalog, config: Config) -> Result<Self> {
        // Rows left behind by a previous process are meaningless now
        let purged = catalog.progress_purge_stale().await?;
        if purged > 0 {
            info!(purged, "Purged stale scan_progress rows");
        }

        let (progress_tx, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                catalog,
                config,
                worker_bin: resolve_worker_bin(),
                table: Mutex::new(JobTable::default()),
                progress_tx,
            }),
        })
    }

    /// Start a scan of `uri`, or return the already-active job for the
    /// same root (requests are coalesced).
    pub fn start(&self, uri: Uri) -> Result<Job> {
        let mut table = self.inner.lock_table();

        if let Some(existing_id) = table.active.get(&uri) {
            if let Some(entry) = table.jobs.get(existing_id) {
                info!(job_id = %existing_id, root = %uri, "Coalesced into active scan");
                return Ok(entry.job.clone());
            }
        }

        let job = Job {
            id: short_id(),
            root_uri: uri.clone(),
            state: JobState::Pending,
            items_found: 0,
            error_count: 0,
            started_at: Catalog::now(),
            finished_at: None,
            scan_id: None,
            message: None,
        };

        table.active.insert(uri, job.id.clone());
        table.jobs.insert(
            job.id.clone(),
            JobEntry {
                job: job.clone(),
                cancel: None,
            },
        );
        table.pending.push_back(job.id.clone());
        Inner::launch_ready(&self.inner, &mut table);

        table
            .jobs
            .get(&job.id)
            .map(|e| e.job.clone())
            .ok_or_else(|| ApiError::internal("job vanished during start"))
    }

    pub fn status(&self, job_id: &str) -> Option<Job> {
        self.inner
            .lock_table()
            .jobs
            .get(job_id)
            .map(|e| e.job.clone())
    }

    /// Jobs that have not reached a terminal state.
    pub fn running(&self) -> Vec<Job> {
        let table = self.inner.lock_table();
        let mut jobs: Vec<Job> = table
            .jobs
            .values()
            .map(|e| e.job.clone())
            .filter(|j| !j.state.is_terminal())
            .collect();
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        jobs
    }

    /// Request cancellation. Pending jobs die immediately; running jobs
    /// get SIGTERM, then SIGKILL after the grace period.
    pub fn cancel(&self, job_id: &str) -> Result<Job> {
        let mut table = self.inner.lock_table();

        let entry = table
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| ApiError::not_found(format!("No job {job_id}")))?;

        match entry.job.state {
            JobState::Pending => {
                entry.job.state = JobState::Cancelled;
                entry.job.finished_at = Some(Catalog::now());
                let job = entry.job.clone();
                let root = job.root_uri.clone();
                let id = job.id.clone();
                table.pending.retain(|p| p != &id);
                table.active.remove(&root);
                self.inner.publish(&job);
                Ok(job)
            }
            JobState::Running => {
                if let Some(cancel) = entry.cancel.take() {
                    let _ = cancel.send(());
                }
                Ok(entry.job.clone())
            }
            _ => Ok(entry.job.clone()),
        }
    }

    /// Cancel every non-terminal job.
    pub fn shutdown(&self) {
        let ids: Vec<String> = {
            let table = self.inner.lock_table();
            table
                .jobs
                .values()
                .filter(|e| !e.job.state.is_terminal())
                .map(|e| e.job.id.clone())
                .collect()
        };
        for id in ids {
            let _ = self.cancel(&id);
        }
    }

    pub fn subscribe(&self) -> ProgressStream {
        ProgressStream {
            rx: self.inner.progress_tx.subscribe(),
        }
    }

    /// True when an active scan overlaps `uri` (same root, an ancestor, or
    /// a descendant). The mutator uses this to serialize against scans.
    pub fn has_overlapping_scan(&self, uri: &Uri) -> bool {
        let table = self.inner.lock_table();
        table.active.keys().any(|root| {
            root.is_ancestor_of(uri) || uri.is_ancestor_of(root)
        })
    }
}

impl Inner {
    fn lock_table(&self) -> std::sync::MutexGuard<'_, JobTable> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Launch pending jobs while below the concurrency cap. Caller holds
    /// the table lock.
    fn launch_ready(inner: &Arc<Inner>, table: &mut JobTable) {
        while table.running < inner.config.max_concurrent_scans {
            let Some(job_id) = table.pending.pop_front() else { break };
            if let Err(err) = Self::launch(inner, table, &job_id) {
                warn!(job_id = %job_id, error = %err, "Failed to launch worker");
                if let Some(entry) = table.jobs.get_mut(&job_id) {
                    entry.job.state = JobState::Failed;
                    entry.job.finished_at = Some(Catalog::now());
                    entry.job.message = Some(err.to_string());
                    let job = entry.job.clone();
                    table.active.remove(&job.root_uri);
                    inner.publish(&job);
                }
            }
        }
    }

    fn launch(inner: &Arc<Inner>, table: &mut JobTable, job_id: &str) -> Result<()> {
        let entry = table
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| ApiError::internal("pending job vanished"))?;
        let root = entry.job.root_uri.clone();

        let mut cmd = Self::worker_command(inner, &root);
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ApiError::internal(format!(
                        "Scan worker '{}' not found. Build it with `cargo build -p disktree_scan` \
                         or set DISKTREE_SCAN_BIN.",
                        inner.worker_bin.display()
                    ))
                } else {
                    ApiError::internal(format!("Failed to spawn scan worker: {e}"))
                }
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ApiError::internal("worker stdout missing"))?;

        let (cancel_tx, cancel_rx) = oneshot::channel();
        entry.job.state = JobState::Running;
        entry.job.started_at = Catalog::now();
        entry.cancel = Some(cancel_tx);
        let job = entry.job.clone();
        table.running += 1;

        inner.publish(&job);
        info!(job_id = %job.id, root = %root, pid = ?child.id(), "Scan worker launched");

        let inner = Arc::clone(inner);
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            supervise(inner, job_id, child, stdout, cancel_rx).await;
        });
        Ok(())
    }

    fn worker_command(inner: &Arc<Inner>, root: &Uri) -> Command {
        let use_sudo = inner.config.sudo_local_probe && root.scheme() == Scheme::Local;
        let mut cmd = if use_sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg("-n").arg(&inner.worker_bin);
            cmd
        } else {
            Command::new(&inner.worker_bin)
        };

        cmd.arg("--uri")
            .arg(root.as_str())
            .arg("--db")
            .arg(inner.config.db_path())
            .arg("--blob-dir")
            .arg(inner.config.blob_dir())
            .arg("--sample-error-paths")
            .arg(inner.config.sample_error_paths.to_string())
            .arg("--progress-tick-ms")
            .arg(inner.config.progress_tick_ms.to_string())
            .arg("--progress-items")
            .arg(inner.config.progress_items_interval.to_string());

        for glob in &inner.config.probe_exclude_globs {
            cmd.arg("--exclude").arg(glob);
        }
        if inner.config.follow_symlinks {
            cmd.arg("--follow-symlinks");
        }
        if !inner.config.dedupe_by_inode {
            cmd.arg("--no-dedupe-by-inode");
        }
        cmd
    }

    fn publish(&self, job: &Job) {
        let _ = self.progress_tx.send(ProgressFrame {
            job_id: job.id.clone(),
            root_uri: job.root_uri.clone(),
            state: job.state,
            items_found: job.items_found,
            error_count: job.error_count,
            items_per_sec: None,
            lagged: false,
        });
    }
}

async fn supervise(
    inner: Arc<Inner>,
    job_id: String,
    mut child: tokio::process::Child,
    mut stdout: tokio::process::ChildStdout,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let mut done_scan_id: Option<i64> = None;
    let mut fatal: Option<(ErrorKind, String)> = None;
    let mut cancelled = false;
    let mut last_published_items = 0u64;

    loop {
        tokio::select! {
            frame = read_frame_async(&mut stdout) => {
                match frame {
                    Ok(Some(WireFrame::Progress(progress))) => {
                        // Monotonic dedup: never republish a stale counter
                        if progress.items_found <= last_published_items {
                            continue;
                        }
                        last_published_items = progress.items_found;

                        let frame = {
                            let mut table = inner.lock_table();
                            let Some(entry) = table.jobs.get_mut(&job_id) else { continue };
                            entry.job.items_found = progress.items_found;
                            entry.job.error_count = progress.error_count;
                            ProgressFrame {
                                job_id: entry.job.id.clone(),
                                root_uri: entry.job.root_uri.clone(),
                                state: entry.job.state,
                                items_found: progress.items_found,
                                error_count: progress.error_count,
                                items_per_sec: progress.items_per_sec,
                                lagged: false,
                            }
                        };
                        let _ = inner.progress_tx.send(frame);
                    }
                    Ok(Some(WireFrame::PathError(err))) => {
                        tracing::debug!(job_id = %job_id, path = %err.path, "Scan path error");
                    }
                    Ok(Some(WireFrame::Done(done))) => {
                        done_scan_id = Some(done.scan_id);
                        let mut table = inner.lock_table();
                        if let Some(entry) = table.jobs.get_mut(&job_id) {
                            entry.job.items_found = done.items_found;
                            entry.job.error_count = done.error_count;
                        }
                    }
                    Ok(Some(WireFrame::Fatal(f))) => {
                        fatal = Some((f.kind, f.message));
                    }
                    Ok(None) => break, // EOF: worker exiting
                    Err(err) => {
                        warn!(job_id = %job_id, error = %err, "Worker stream error");
                        break;
                    }
                }
            }
            _ = &mut cancel_rx, if !cancelled => {
                cancelled = true;
                terminate(&inner, &job_id, &mut child).await;
                break;
            }
        }
    }

    let status = child.wait().await;

    let final_job = {
        let mut table = inner.lock_table();
        let entry = match table.jobs.get_mut(&job_id) {
            Some(entry) => entry,
            None => return,
        };

        entry.job.finished_at = Some(Catalog::now());
        entry.cancel = None;
        if cancelled {
            entry.job.state = JobState::Cancelled;
            entry.job.message = Some("cancelled".to_string());
        } else {
            match (&status, done_scan_id) {
                (Ok(s), Some(scan_id)) if s.success() => {
                    entry.job.state = JobState::Completed;
                    entry.job.scan_id = Some(scan_id);
                }
                (Ok(s), _) => {
                    entry.job.state = JobState::Failed;
                    entry.job.message = Some(match &fatal {
                        Some((kind, msg)) => format!("{kind}: {msg}"),
                        None => format!("worker exited with {s}"),
                    });
                }
                (Err(e), _) => {
                    entry.job.state = JobState::Failed;
                    entry.job.message = Some(format!("wait failed: {e}"));
                }
            }
        }

        let job = entry.job.clone();
        table.active.remove(&job.root_uri);
        table.running = table.running.saturating_sub(1);
        Inner::launch_ready(&inner, &mut table);
        job
    };

    info!(
        job_id = %final_job.id,
        root = %final_job.root_uri,
        state = %final_job.state,
        items = final_job.items_found,
        "Scan job finished"
    );
    inner.publish(&final_job);
}

/// SIGTERM, wait out the grace period, then SIGKILL.
async fn terminate(inner: &Arc<Inner>, job_id: &str, child: &mut tokio::process::Child) {
    let grace = inner.config.term_grace();

    if let Some(pid) = child.id() {
        info!(job_id, pid, "Cancelling scan worker");
        #[cfg(unix)]
        // SAFETY: pid belongs to our still-owned child handle
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        #[cfg(not(unix))]
        let _ = child.start_kill();
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!(job_id, "Worker ignored SIGTERM, killing");
            let _ = child.start_kill();
        }
    }
}

fn resolve_worker_bin() -> PathBuf {
    std::env::var("DISKTREE_SCAN_BIN")
        .map(PathBuf::from)
        .ok()
        .or_else(|| {
            std::env::current_exe().ok().and_then(|exe| {
                exe.parent()
                    .map(|dir| dir.join("disktree-scan"))
                    .filter(|candidate| candidate.exists())
            })
        })
        .unwrap_or_else(|| PathBuf::from("disktree-scan"))
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}
