//! Record and payload types shared across the service and worker.

use crate::uri::Uri;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Error taxonomy
// ============================================================================

/// Machine-readable error kind carried on every failed operation.
/// This is the CANONICAL taxonomy - use this everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No scan covers the URI
    NotFound,
    UnsupportedScheme,
    InvalidUri,
    /// Permission denied at the source root
    SourcePermission,
    /// Retryable probe I/O failure
    SourceTransient,
    BlobCorrupt,
    CatalogConflict,
    Aborted,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::UnsupportedScheme => "unsupported_scheme",
            ErrorKind::InvalidUri => "invalid_uri",
            ErrorKind::SourcePermission => "source_permission",
            ErrorKind::SourceTransient => "source_transient",
            ErrorKind::BlobCorrupt => "blob_corrupt",
            ErrorKind::CatalogConflict => "catalog_conflict",
            ErrorKind::Aborted => "aborted",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Snapshot nodes
// ============================================================================

/// File-or-directory discriminator for a snapshot node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Dir,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::File => "file",
            NodeKind::Dir => "dir",
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, NodeKind::Dir)
    }
}

impl FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(NodeKind::File),
            "dir" => Ok(NodeKind::Dir),
            other => Err(format!("Invalid node kind: '{other}'")),
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One row of a snapshot.
///
/// `depth` is relative to the snapshot root (root = 0); `parent` is `None`
/// only for the root. Directory aggregates obey the rollup invariants:
/// `size` sums the children, `mtime` is the max child mtime, and `n_desc`
/// counts every node strictly below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub uri: Uri,
    pub kind: NodeKind,
    pub size: u64,
    /// Modification time, epoch seconds.
    pub mtime: i64,
    pub parent: Option<Uri>,
    pub depth: u32,
    pub n_children: u32,
    pub n_desc: u64,
}

/// A raw observation from a probe, before aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEntry {
    pub uri: Uri,
    pub kind: NodeKind,
    pub size: u64,
    pub mtime: i64,
}

/// An immutable tree snapshot produced by one scan.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub root_uri: Uri,
    /// Completion time, epoch seconds.
    pub completed_at: i64,
    pub error_count: u64,
    /// Sampled unreadable paths (bounded).
    pub error_paths: Vec<String>,
    /// Nodes ordered by `(depth, uri)`.
    pub nodes: Vec<Node>,
}

// ============================================================================
// Catalog records
// ============================================================================

/// A completed scan as recorded in the catalog.
///
/// The `root_*` fields denormalize the snapshot root so listings and
/// planning never open the blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub id: i64,
    pub root_uri: Uri,
    pub completed_at: i64,
    pub blob_id: String,
    pub root_size: u64,
    pub root_n_children: u32,
    pub root_n_desc: u64,
    pub error_count: u64,
    pub error_paths: Vec<String>,
    pub needs_repair: bool,
}

/// Status of an in-flight scan's progress row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Running,
    Completed,
    Failed,
}

impl ProgressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStatus::Running => "running",
            ProgressStatus::Completed => "completed",
            ProgressStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(ProgressStatus::Running),
            "completed" => Some(ProgressStatus::Completed),
            "failed" => Some(ProgressStatus::Failed),
            _ => None,
        }
    }
}

/// Ephemeral per-scan progress row; removed when the scan terminates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanProgressRow {
    pub id: i64,
    pub root_uri: Uri,
    pub worker_pid: i64,
    pub started_at: i64,
    pub items_found: u64,
    pub items_per_sec: Option<f64>,
    pub error_count: u64,
    pub status: ProgressStatus,
}

// ============================================================================
// Planner response
// ============================================================================

/// Coverage of a view: `Full` (exact scan, no patches), `Partial`
/// (ancestor slice and/or fresher-child patches), `None` (no coverage).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Full,
    Partial,
    None,
}

/// Per-node scan marker. Serialized the way the UI consumes it:
/// `true`, `"partial"`, or `false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scanned {
    Yes,
    Partial,
    #[default]
    No,
}

impl Serialize for Scanned {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Scanned::Yes => serializer.serialize_bool(true),
            Scanned::No => serializer.serialize_bool(false),
            Scanned::Partial => serializer.serialize_str("partial"),
        }
    }
}

impl<'de> Deserialize<'de> for Scanned {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;
        let value = serde_json::Value::deserialize(deserializer)?;
        match value {
            serde_json::Value::Bool(true) => Ok(Scanned::Yes),
            serde_json::Value::Bool(false) => Ok(Scanned::No),
            serde_json::Value::String(s) if s == "partial" => Ok(Scanned::Partial),
            other => Err(D::Error::custom(format!("invalid scanned marker: {other}"))),
        }
    }
}

/// A node in a [`View`], re-rooted at the query URI.
///
/// `path` is the suffix relative to the view root (`"."` for the root);
/// `parent` is the rebased parent suffix (`None` for the root).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewNode {
    pub path: String,
    pub uri: Uri,
    pub kind: NodeKind,
    pub size: u64,
    pub mtime: i64,
    pub parent: Option<String>,
    pub depth: u32,
    pub n_children: u32,
    pub n_desc: u64,
    pub scanned: Scanned,
    /// Completion time of the scan this node's aggregates came from.
    pub scan_time: Option<i64>,
}

/// The planner's answer to `view(uri, depth)`: a re-rooted, possibly
/// mixed-freshness slice of one or more snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct View {
    pub status: ScanStatus,
    pub root: Option<ViewNode>,
    /// Direct children of the root, largest first.
    pub children: Vec<ViewNode>,
    /// Every node within the requested depth.
    pub rows: Vec<ViewNode>,
    pub completed_at: Option<i64>,
    /// Root of the ancestor scan the base slice came from.
    pub scan_root: Option<Uri>,
    pub scan_id: Option<i64>,
}

impl View {
    pub fn none() -> Self {
        Self {
            status: ScanStatus::None,
            root: None,
            children: Vec::new(),
            rows: Vec::new(),
            completed_at: None,
            scan_root: None,
            scan_id: None,
        }
    }
}

// ============================================================================
// Compare
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareStatus {
    Added,
    Removed,
    Changed,
    Unchanged,
}

/// One direct child of the compared URI, across two scans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompareRow {
    pub path: String,
    pub status: CompareStatus,
    pub size_old: Option<u64>,
    pub size_new: Option<u64>,
    pub size_delta: i64,
    pub n_desc_old: Option<u64>,
    pub n_desc_new: Option<u64>,
    pub n_desc_delta: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub uri: Uri,
    pub scan_a: i64,
    pub scan_b: i64,
    pub rows: Vec<CompareRow>,
    pub total_delta: i64,
}

// ============================================================================
// Jobs and progress frames
// ============================================================================

/// Lifecycle of a scheduled scan job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Scheduler-side description of a scan job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub root_uri: Uri,
    pub state: JobState,
    pub items_found: u64,
    pub error_count: u64,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    /// Catalog scan id, set on success.
    pub scan_id: Option<i64>,
    pub message: Option<String>,
}

/// One push-stream update published to progress subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressFrame {
    pub job_id: String,
    pub root_uri: Uri,
    pub state: JobState,
    pub items_found: u64,
    pub error_count: u64,
    pub items_per_sec: Option<f64>,
    /// Set when the subscriber missed frames and this one follows a gap.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub lagged: bool,
}

/// Result of a filesystem delete plus snapshot repair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteResult {
    pub ok: bool,
    pub uri: Uri,
    pub deleted_size: u64,
    pub deleted_n_desc: u64,
    /// Paths that could not be removed.
    pub errors: Vec<String>,
}
