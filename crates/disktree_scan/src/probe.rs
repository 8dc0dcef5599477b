//! The probe contract: a source enumerator that pushes raw entries and
//! per-path errors into a sink.

use crate::error::ProbeError;
use crate::local::LocalProbe;
use crate::object::ObjectProbe;
use async_trait::async_trait;
use disktree_protocol::{RawEntry, Scheme, Uri};
use tokio::sync::mpsc;

/// Configuration options common to all probe variants.
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    /// Glob patterns (relative to the scan root) whose subtrees are elided,
    /// e.g. cloud-mount overlays that would block on network I/O.
    pub exclude_globs: Vec<String>,
    pub follow_symlinks: bool,
    /// Skip inodes already visited (guards against link cycles when
    /// `follow_symlinks` is on).
    pub dedupe_by_inode: bool,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            dedupe_by_inode: true,
        }
    }
}

/// Events a probe pushes while enumerating.
#[derive(Debug, Clone)]
pub enum ProbeEvent {
    Entry(RawEntry),
    /// A path that could not be read; never fatal below the root.
    PathError { path: String, message: String },
}

/// Cheap-to-clone handle the probe pushes events into. The consumer side
/// controls pacing by draining the channel.
#[derive(Clone)]
pub struct ProbeSink {
    tx: mpsc::UnboundedSender<ProbeEvent>,
}

impl ProbeSink {
    pub fn entry(&self, entry: RawEntry) {
        let _ = self.tx.send(ProbeEvent::Entry(entry));
    }

    pub fn path_error(&self, path: impl Into<String>, message: impl Into<String>) {
        let _ = self.tx.send(ProbeEvent::PathError {
            path: path.into(),
            message: message.into(),
        });
    }
}

/// Build the sink/receiver pair for one probe run.
pub fn probe_channel() -> (ProbeSink, mpsc::UnboundedReceiver<ProbeEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ProbeSink { tx }, rx)
}

/// A finite, non-restartable enumeration of one source.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Enumerate the tree under `root`, pushing one entry per object.
    /// Returns `Err` only for failures that invalidate the whole scan.
    async fn run(&self, root: Uri, sink: ProbeSink) -> Result<(), ProbeError>;
}

/// Select the probe implementation for a URI's scheme.
pub fn probe_for(root: &Uri, options: ProbeOptions) -> Box<dyn Probe> {
    match root.scheme() {
        Scheme::Local => Box::new(LocalProbe::new(options)),
        Scheme::Object => Box::new(ObjectProbe::new(options)),
    }
}
