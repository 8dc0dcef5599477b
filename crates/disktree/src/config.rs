//! Service configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for the disktree service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Metadata home; blobs and the catalog live under it by default
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Blob directory (default: `<root_dir>/blobs`)
    #[serde(default)]
    pub blob_dir: Option<PathBuf>,

    /// Catalog database path (default: `<root_dir>/disktree.sqlite3`)
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    #[serde(default = "default_max_concurrent_scans")]
    pub max_concurrent_scans: usize,

    #[serde(default = "default_sample_error_paths")]
    pub sample_error_paths: usize,

    /// Glob patterns elided from probes (cloud-mount overlays and the like)
    #[serde(default)]
    pub probe_exclude_globs: Vec<String>,

    #[serde(default)]
    pub follow_symlinks: bool,

    #[serde(default = "default_true")]
    pub dedupe_by_inode: bool,

    /// Launch local scan workers through sudo (block-accurate sizing on
    /// paths the service user cannot read)
    #[serde(default)]
    pub sudo_local_probe: bool,

    /// Progress persistence cadence in milliseconds
    #[serde(default = "default_progress_tick_ms")]
    pub progress_tick_ms: u64,

    /// Progress persistence cadence in items
    #[serde(default = "default_progress_items")]
    pub progress_items_interval: u64,

    /// Grace period between SIGTERM and SIGKILL on cancel, milliseconds
    #[serde(default = "default_term_grace_ms")]
    pub term_grace_ms: u64,

    /// GC retention window in seconds; superseded snapshots younger than
    /// this survive
    #[serde(default = "default_retention_secs")]
    pub retention_secs: i64,
}

fn default_root_dir() -> PathBuf {
    if let Ok(home) = std::env::var("DISKTREE_HOME") {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .map(|h| h.join(".disktree"))
        .unwrap_or_else(|| PathBuf::from(".disktree"))
}

fn default_max_concurrent_scans() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
}

fn default_sample_error_paths() -> usize {
    100
}

fn default_true() -> bool {
    true
}

fn default_progress_tick_ms() -> u64 {
    2000
}

fn default_progress_items() -> u64 {
    10_000
}

fn default_term_grace_ms() -> u64 {
    5000
}

fn default_retention_secs() -> i64 {
    30 * 24 * 3600
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            blob_dir: None,
            db_path: None,
            max_concurrent_scans: default_max_concurrent_scans(),
            sample_error_paths: default_sample_error_paths(),
            probe_exclude_globs: Vec::new(),
            follow_symlinks: false,
            dedupe_by_inode: true,
            sudo_local_probe: false,
            progress_tick_ms: default_progress_tick_ms(),
            progress_items_interval: default_progress_items(),
            term_grace_ms: default_term_grace_ms(),
            retention_secs: default_retention_secs(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load `<root>/config.toml` if present, defaults otherwise.
    pub fn load_default() -> Self {
        let candidate = default_root_dir().join("config.toml");
        if candidate.exists() {
            match Self::load(&candidate) {
                Ok(config) => return config,
                Err(err) => {
                    tracing::warn!(path = %candidate.display(), error = %err, "Bad config, using defaults");
                }
            }
        }
        Self::default()
    }

    /// Anchor a test/ad-hoc configuration at a specific directory.
    pub fn at_root(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            ..Self::default()
        }
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.blob_dir
            .clone()
            .unwrap_or_else(|| self.root_dir.join("blobs"))
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.root_dir.join("disktree.sqlite3"))
    }

    pub fn progress_tick(&self) -> Duration {
        Duration::from_millis(self.progress_tick_ms)
    }

    pub fn term_grace(&self) -> Duration {
        Duration::from_millis(self.term_grace_ms)
    }
}
