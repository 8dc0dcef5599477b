//! disktree CLI - the embedded front-end that drives scans and queries.
//!
//! Usage:
//!     disktree scan /data
//!     disktree view /data --depth 2
//!     disktree compare /data 3 7

use clap::{Parser, Subcommand};
use disktree::{Config, Disktree};
use disktree_protocol::{exit, JobState, ScanStatus};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "disktree", about = "Disk-space indexing and query engine")]
struct Args {
    /// Config file (default: <root>/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Metadata home (overrides config)
    #[arg(long, global = true)]
    root_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Scan a URI into a new snapshot
    Scan {
        uri: String,
        /// Return immediately instead of waiting for completion
        #[arg(long)]
        no_wait: bool,
    },
    /// Show what is known about a URI
    View {
        uri: String,
        #[arg(long, default_value_t = 2)]
        depth: u32,
        /// Query deadline in milliseconds
        #[arg(long)]
        deadline_ms: Option<u64>,
        #[arg(long)]
        json: bool,
    },
    /// List the most recent scan per root
    Scans,
    /// List all scans covering a URI, newest first
    History { uri: String },
    /// Diff a URI's children between two scans
    Compare {
        uri: String,
        scan_a: i64,
        scan_b: i64,
        #[arg(long)]
        json: bool,
    },
    /// Delete a local path and repair affected snapshots
    Delete { uri: String },
    /// Evict superseded snapshots and sweep orphaned blobs
    Gc,
    /// List object-store buckets
    Buckets,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "disktree=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("error: bad config {}: {err}", path.display());
                std::process::exit(exit::INVALID_INPUT);
            }
        },
        None => Config::load_default(),
    };
    if let Some(root_dir) = args.root_dir {
        config.root_dir = root_dir;
    }

    let service = match Disktree::open(config).await {
        Ok(service) => service,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.exit_code());
        }
    };

    let code = match run(&service, args.command).await {
        Ok(()) => exit::SUCCESS,
        Err(err) => {
            eprintln!("error ({}): {}", err.kind, err.message);
            err.exit_code()
        }
    };

    service.shutdown().await;
    std::process::exit(code);
}

async fn run(service: &Disktree, command: CliCommand) -> disktree::Result<()> {
    match command {
        CliCommand::Scan { uri, no_wait } => {
            // Subscribe first so the job's terminal frame cannot be missed
            let mut stream = service.subscribe_progress();
            let job = service.start_scan(&uri)?;
            println!("job {}  {}  {}", job.id, job.root_uri, job.state);
            if no_wait {
                return Ok(());
            }
            while let Some(frame) = stream.recv().await {
                if frame.job_id != job.id {
                    continue;
                }
                if frame.state.is_terminal() {
                    let status = service.scan_status(&job.id)?;
                    println!(
                        "{}: {} items, {} errors",
                        status.state, status.items_found, status.error_count
                    );
                    if status.state != JobState::Completed {
                        return Err(disktree::ApiError::aborted(
                            status.message.unwrap_or_else(|| "scan failed".to_string()),
                        ));
                    }
                    return Ok(());
                }
                eprintln!(
                    "  {} items, {} errors{}",
                    frame.items_found,
                    frame.error_count,
                    frame
                        .items_per_sec
                        .map(|r| format!(", {r:.0}/s"))
                        .unwrap_or_default()
                );
            }
            Ok(())
        }
        CliCommand::View {
            uri,
            depth,
            deadline_ms,
            json,
        } => {
            let deadline = deadline_ms.map(Duration::from_millis);
            let view = service.view(&uri, depth, deadline).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&view).unwrap_or_default());
                return Ok(());
            }

            if view.status == ScanStatus::None {
                println!("no scan covers {uri}");
                return Ok(());
            }
            if let Some(root) = &view.root {
                println!(
                    "{}  {}  {} children, {} descendants  [{}]",
                    uri,
                    human_size(root.size),
                    root.n_children,
                    root.n_desc,
                    match view.status {
                        ScanStatus::Full => "full",
                        ScanStatus::Partial => "partial",
                        ScanStatus::None => "none",
                    }
                );
            }
            for child in &view.children {
                println!(
                    "  {:>10}  {:>9}  {}",
                    human_size(child.size),
                    child.n_desc,
                    child.path
                );
            }
            Ok(())
        }
        CliCommand::Scans => {
            for scan in service.list_scans().await? {
                println!(
                    "{:>5}  {}  {:>10}  {:>9} desc  {}{}",
                    scan.id,
                    format_time(scan.completed_at),
                    human_size(scan.root_size),
                    scan.root_n_desc,
                    scan.root_uri,
                    if scan.needs_repair { "  (needs repair)" } else { "" }
                );
            }
            Ok(())
        }
        CliCommand::History { uri } => {
            for scan in service.history(&uri).await? {
                println!(
                    "{:>5}  {}  {:>10}  {}",
                    scan.id,
                    format_time(scan.completed_at),
                    human_size(scan.root_size),
                    scan.root_uri
                );
            }
            Ok(())
        }
        CliCommand::Compare {
            uri,
            scan_a,
            scan_b,
            json,
        } => {
            let cmp = service.compare(&uri, scan_a, scan_b, None).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&cmp).unwrap_or_default());
                return Ok(());
            }
            for row in &cmp.rows {
                println!(
                    "{:<9} {:>+12}  {}",
                    format!("{:?}", row.status).to_lowercase(),
                    row.size_delta,
                    row.path
                );
            }
            println!("total {:+}", cmp.total_delta);
            Ok(())
        }
        CliCommand::Delete { uri } => {
            let result = service.delete(&uri).await?;
            println!(
                "deleted {}: {} freed, {} entries",
                result.uri,
                human_size(result.deleted_size),
                result.deleted_n_desc
            );
            for err in &result.errors {
                eprintln!("  failed: {err}");
            }
            Ok(())
        }
        CliCommand::Gc => {
            let stats = service.gc().await?;
            println!(
                "gc: {} scans, {} blobs removed",
                stats.scans_deleted, stats.blobs_deleted
            );
            Ok(())
        }
        CliCommand::Buckets => {
            for bucket in service.list_buckets().await? {
                println!("s3://{bucket}");
            }
            Ok(())
        }
    }
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "K", "M", "G", "T", "P"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}B")
    } else {
        format!("{value:.1}{}", UNITS[unit])
    }
}

fn format_time(epoch: i64) -> String {
    chrono::DateTime::from_timestamp(epoch, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| epoch.to_string())
}
