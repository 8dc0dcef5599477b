//! Scanning: probes that enumerate a source, the aggregator that folds the
//! entry stream into a tree snapshot, and the worker pipeline that commits
//! the result (blob first, catalog row last).

pub mod aggregate;
mod error;
pub mod local;
pub mod object;
pub mod pipeline;
pub mod probe;

pub use error::{ProbeError, Result, ScanError};
pub use pipeline::{run_scan, ScanOptions, ScanOutcome};
pub use probe::{probe_channel, probe_for, Probe, ProbeEvent, ProbeOptions, ProbeSink};
