//! Snapshot deserialization with row-group level predicate pushdown.

use crate::error::{BlobError, Result};
use crate::writer::{META_COMPLETED_AT, META_DEPTH_INDEX, META_ERROR_COUNT, META_ROOT_URI};
use arrow::array::{Array, Int64Array, StringArray, UInt32Array, UInt64Array};
use arrow::record_batch::RecordBatch;
use disktree_protocol::{Node, NodeKind, Uri};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Snapshot header persisted in the Parquet footer.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotMeta {
    pub root_uri: Uri,
    pub completed_at: i64,
    pub error_count: u64,
}

/// Row filter for [`SnapshotReader::scan`]. Set fields combine with AND;
/// the default matches every node.
#[derive(Debug, Clone, Default)]
pub struct NodePredicate {
    /// Keep nodes with `depth <= k`. Evaluated against the row-group depth
    /// index before any rows decode.
    pub depth_le: Option<u32>,
    /// Keep the node at this URI and everything below it.
    pub uri_prefix: Option<Uri>,
    /// Keep exactly this URI.
    pub uri_eq: Option<Uri>,
}

impl NodePredicate {
    fn matches(&self, node: &Node) -> bool {
        if let Some(k) = self.depth_le {
            if node.depth > k {
                return false;
            }
        }
        if let Some(prefix) = &self.uri_prefix {
            if !prefix.is_ancestor_of(&node.uri) {
                return false;
            }
        }
        if let Some(eq) = &self.uri_eq {
            if &node.uri != eq {
                return false;
            }
        }
        true
    }
}

/// Open handle on one snapshot blob.
#[derive(Debug)]
pub struct SnapshotReader {
    path: PathBuf,
    meta: SnapshotMeta,
    /// `(min_depth, max_depth)` per row group, in file order.
    depth_index: Vec<(u32, u32)>,
}

impl SnapshotReader {
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;

        let kv: HashMap<String, String> = builder
            .metadata()
            .file_metadata()
            .key_value_metadata()
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|e| e.value.clone().map(|v| (e.key.clone(), v)))
                    .collect()
            })
            .unwrap_or_default();

        let root_uri = kv
            .get(META_ROOT_URI)
            .ok_or_else(|| BlobError::corrupt("missing root_uri metadata"))
            .and_then(|raw| {
                Uri::parse(raw).map_err(|e| BlobError::corrupt(format!("bad root_uri: {e}")))
            })?;
        let completed_at = parse_meta_int(&kv, META_COMPLETED_AT)?;
        let error_count = parse_meta_int(&kv, META_ERROR_COUNT)? as u64;

        let depth_index: Vec<(u32, u32)> = kv
            .get(META_DEPTH_INDEX)
            .ok_or_else(|| BlobError::corrupt("missing depth index"))
            .and_then(|raw| {
                serde_json::from_str(raw)
                    .map_err(|e| BlobError::corrupt(format!("bad depth index: {e}")))
            })?;

        if depth_index.len() != builder.metadata().num_row_groups() {
            return Err(BlobError::corrupt(format!(
                "depth index covers {} row groups, file has {}",
                depth_index.len(),
                builder.metadata().num_row_groups()
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
            meta: SnapshotMeta {
                root_uri,
                completed_at,
                error_count,
            },
            depth_index,
        })
    }

    pub fn meta(&self) -> &SnapshotMeta {
        &self.meta
    }

    /// Decode the nodes matching `predicate`.
    ///
    /// A `depth_le` bound prunes row groups from the depth index without
    /// touching their pages; other predicate fields filter decoded rows.
    pub fn scan(&self, predicate: &NodePredicate) -> Result<Vec<Node>> {
        let file = File::open(&self.path)?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;

        let row_groups: Vec<usize> = match predicate.depth_le {
            Some(k) => self
                .depth_index
                .iter()
                .enumerate()
                .filter(|(_, (min, _))| *min <= k)
                .map(|(i, _)| i)
                .collect(),
            None => (0..self.depth_index.len()).collect(),
        };

        if row_groups.is_empty() {
            return Ok(Vec::new());
        }

        let reader = builder.with_row_groups(row_groups).build()?;

        let mut nodes = Vec::new();
        for batch in reader {
            let batch = batch?;
            decode_batch(&batch, predicate, &mut nodes)?;
        }
        Ok(nodes)
    }

    /// Convenience: the root node of the snapshot.
    pub fn root_node(&self) -> Result<Node> {
        let nodes = self.scan(&NodePredicate {
            depth_le: Some(0),
            ..Default::default()
        })?;
        nodes
            .into_iter()
            .next()
            .ok_or_else(|| BlobError::corrupt("snapshot has no root row"))
    }
}

fn parse_meta_int(kv: &HashMap<String, String>, key: &str) -> Result<i64> {
    kv.get(key)
        .ok_or_else(|| BlobError::corrupt(format!("missing {key} metadata")))
        .and_then(|raw| {
            raw.parse()
                .map_err(|_| BlobError::corrupt(format!("bad {key}: '{raw}'")))
        })
}

fn decode_batch(
    batch: &RecordBatch,
    predicate: &NodePredicate,
    out: &mut Vec<Node>,
) -> Result<()> {
    let uris = column::<StringArray>(batch, "uri")?;
    let kinds = column::<StringArray>(batch, "kind")?;
    let sizes = column::<UInt64Array>(batch, "size")?;
    let mtimes = column::<Int64Array>(batch, "mtime")?;
    let parents = column::<StringArray>(batch, "parent")?;
    let depths = column::<UInt32Array>(batch, "depth")?;
    let n_children = column::<UInt32Array>(batch, "n_children")?;
    let n_desc = column::<UInt64Array>(batch, "n_desc")?;

    for i in 0..batch.num_rows() {
        let uri = Uri::parse(uris.value(i))
            .map_err(|e| BlobError::corrupt(format!("bad node uri: {e}")))?;
        let kind = NodeKind::from_str(kinds.value(i)).map_err(BlobError::Corrupt)?;
        let parent = if parents.is_null(i) {
            None
        } else {
            Some(
                Uri::parse(parents.value(i))
                    .map_err(|e| BlobError::corrupt(format!("bad parent uri: {e}")))?,
            )
        };

        let node = Node {
            uri,
            kind,
            size: sizes.value(i),
            mtime: mtimes.value(i),
            parent,
            depth: depths.value(i),
            n_children: n_children.value(i),
            n_desc: n_desc.value(i),
        };

        if predicate.matches(&node) {
            out.push(node);
        }
    }
    Ok(())
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    let idx = batch
        .schema()
        .index_of(name)
        .map_err(|_| BlobError::corrupt(format!("missing column '{name}'")))?;
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| BlobError::corrupt(format!("column '{name}' has unexpected type")))
}
