//! Object store probe (S3 and S3-compatible services).
//!
//! Enumerates keys beneath a prefix with paginated ListObjectsV2. Only file
//! entries are emitted; directories are synthesized from key prefixes by
//! the aggregator.

use crate::error::ProbeError;
use crate::probe::{Probe, ProbeOptions, ProbeSink};
use async_trait::async_trait;
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::Client;
use disktree_protocol::{NodeKind, RawEntry, Scheme, Uri};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::time::Duration;
use tracing::{debug, warn};

/// Attempts per page before a transient listing failure becomes fatal.
const MAX_ATTEMPTS: u32 = 3;
/// Base backoff between attempts; doubles per retry.
const RETRY_BASE: Duration = Duration::from_millis(200);

pub struct ObjectProbe {
    options: ProbeOptions,
}

impl ObjectProbe {
    pub fn new(options: ProbeOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Probe for ObjectProbe {
    async fn run(&self, root: Uri, sink: ProbeSink) -> Result<(), ProbeError> {
        let (bucket, prefix) = split_object_uri(&root)?;
        let excludes = build_excludes(&self.options.exclude_globs)?;

        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let client = Client::new(&config);

        let key_prefix = if prefix.is_empty() {
            String::new()
        } else {
            format!("{prefix}/")
        };

        let mut continuation: Option<String> = None;
        let mut pages = 0u64;
        loop {
            let resp = list_page(&client, &bucket, &key_prefix, continuation.clone()).await?;
            pages += 1;

            for object in resp.contents() {
                let Some(key) = object.key() else { continue };
                // Console-created "folder" placeholders
                if key.ends_with('/') {
                    continue;
                }

                let rel = &key[key_prefix.len()..];
                if !excludes.is_empty() && excludes.is_match(rel) {
                    continue;
                }

                let uri = match Uri::parse(&format!("s3://{bucket}/{key}")) {
                    Ok(uri) => uri,
                    Err(err) => {
                        sink.path_error(key.to_string(), err.to_string());
                        continue;
                    }
                };

                sink.entry(RawEntry {
                    uri,
                    kind: NodeKind::File,
                    size: object.size().unwrap_or(0).max(0) as u64,
                    mtime: object.last_modified().map(|t| t.secs()).unwrap_or(0),
                });
            }

            if !resp.is_truncated().unwrap_or(false) {
                break;
            }
            continuation = resp.next_continuation_token().map(String::from);
        }

        debug!(root = %root, pages, "Object probe finished");
        Ok(())
    }
}

async fn list_page(
    client: &Client,
    bucket: &str,
    key_prefix: &str,
    continuation: Option<String>,
) -> Result<aws_sdk_s3::operation::list_objects_v2::ListObjectsV2Output, ProbeError> {
    let mut attempt = 0u32;
    loop {
        let mut req = client
            .list_objects_v2()
            .bucket(bucket)
            .set_continuation_token(continuation.clone());
        if !key_prefix.is_empty() {
            req = req.prefix(key_prefix);
        }

        match req.send().await {
            Ok(resp) => return Ok(resp),
            Err(err) => {
                if let Some(code) = err.as_service_error().and_then(|e| e.meta().code()) {
                    match code {
                        "NoSuchBucket" => {
                            return Err(ProbeError::RootNotFound(format!("s3://{bucket}")))
                        }
                        "AccessDenied" => {
                            return Err(ProbeError::RootPermission(format!("s3://{bucket}")))
                        }
                        _ => {}
                    }
                }

                attempt += 1;
                if attempt >= MAX_ATTEMPTS {
                    return Err(ProbeError::ObjectStore(err.to_string()));
                }
                let backoff = RETRY_BASE * 2u32.pow(attempt - 1);
                warn!(bucket, attempt, ?backoff, error = %err, "Retrying object listing");
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

/// List the buckets visible to the configured credentials.
pub async fn list_buckets() -> Result<Vec<String>, ProbeError> {
    let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let client = Client::new(&config);

    let resp = client
        .list_buckets()
        .send()
        .await
        .map_err(|e| ProbeError::ObjectStore(e.to_string()))?;

    Ok(resp
        .buckets()
        .iter()
        .filter_map(|b| b.name().map(String::from))
        .collect())
}

fn split_object_uri(uri: &Uri) -> Result<(String, String), ProbeError> {
    if uri.scheme() != Scheme::Object {
        return Err(ProbeError::Config(format!("not an object URI: {uri}")));
    }
    let rest = &uri.as_str()["s3://".len()..];
    match rest.split_once('/') {
        Some((bucket, key)) => Ok((bucket.to_string(), key.to_string())),
        None => Ok((rest.to_string(), String::new())),
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
