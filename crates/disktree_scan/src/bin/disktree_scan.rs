//! disktree scan worker.
//!
//! Spawned by the scheduler, one process per scan. Runs the
//! Probe -> Aggregator -> BlobStore -> Catalog pipeline, streaming progress
//! frames on stdout (stderr carries logs). Exit codes follow the shared
//! convention: 0 ok, 2 invalid input, 3 unsupported scheme, 4 access denied
//! on the root, 5 aborted.

use clap::Parser;
use disktree_protocol::wire::{self, DoneWire, FatalWire, WireFrame};
use disktree_protocol::{exit, Uri};
use disktree_scan::{run_scan, ProbeOptions, ScanOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "disktree-scan", about = "Scan worker for disktree")]
struct Args {
    /// Root URI to scan (local path or s3://bucket/prefix)
    #[arg(long)]
    uri: String,

    /// Catalog database path
    #[arg(long)]
    db: PathBuf,

    /// Blob directory
    #[arg(long)]
    blob_dir: PathBuf,

    /// Exclude glob, relative to the root (repeatable)
    #[arg(long = "exclude")]
    exclude_globs: Vec<String>,

    #[arg(long)]
    follow_symlinks: bool,

    /// Disable (dev,inode) dedup when following symlinks
    #[arg(long)]
    no_dedupe_by_inode: bool,

    /// Max unreadable paths sampled into the scan row
    #[arg(long, default_value_t = 100)]
    sample_error_paths: usize,

    /// Progress persistence cadence in milliseconds
    #[arg(long, default_value_t = 2000)]
    progress_tick_ms: u64,

    /// Progress persistence cadence in items
    #[arg(long, default_value_t = 10_000)]
    progress_items: u64,
}

#[tokio::main]
async fn main() {
    // stdout is the wire channel; logs go to stderr only
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "disktree_scan=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    std::process::exit(run(args).await);
}

async fn run(args: Args) -> i32 {
    let stdout = std::io::stdout();

    let root = match Uri::parse(&args.uri) {
        Ok(root) => root,
        Err(err) => {
            tracing::error!(error = %err, "Invalid scan root");
            let code = match err {
                disktree_protocol::UriError::UnsupportedScheme(_) => exit::UNSUPPORTED_SCHEME,
                _ => exit::INVALID_INPUT,
            };
            emit(&stdout, &fatal_frame(&err.to_string(), code));
            return code;
        }
    };

    let options = ScanOptions {
        root,
        db_path: args.db,
        blob_dir: args.blob_dir,
        probe: ProbeOptions {
            exclude_globs: args.exclude_globs,
            follow_symlinks: args.follow_symlinks,
            dedupe_by_inode: !args.no_dedupe_by_inode,
        },
        sample_error_paths: args.sample_error_paths,
        progress_tick: Duration::from_millis(args.progress_tick_ms),
        progress_items_interval: args.progress_items.max(1),
    };

    let result = run_scan(options, |frame| emit(&stdout, &frame)).await;

    match result {
        Ok(outcome) => {
            emit(
                &stdout,
                &WireFrame::Done(DoneWire {
                    scan_id: outcome.scan_id,
                    items_found: outcome.items_found,
                    error_count: outcome.error_count,
                    duration_ms: outcome.duration_ms,
                }),
            );
            exit::SUCCESS
        }
        Err(err) => {
            let kind = err.kind();
            emit(
                &stdout,
                &WireFrame::Fatal(FatalWire {
                    kind,
                    message: err.to_string(),
                }),
            );
            exit::code_for(kind)
        }
    }
}

fn fatal_frame(message: &str, code: i32) -> WireFrame {
    let kind = if code == exit::UNSUPPORTED_SCHEME {
        disktree_protocol::ErrorKind::UnsupportedScheme
    } else {
        disktree_protocol::ErrorKind::InvalidUri
    };
    WireFrame::Fatal(FatalWire {
        kind,
        message: message.to_string(),
    })
}

fn emit(stdout: &std::io::Stdout, frame: &WireFrame) {
    let mut handle = stdout.lock();
    if wire::write_frame(&mut handle, frame).is_err() {
        // Supervisor went away; keep scanning, the catalog commit still counts
        tracing::warn!("Failed to write progress frame");
    }
    let _ = handle.flush();
}
