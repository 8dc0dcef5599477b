//! Snapshot serialization into depth-ordered Parquet.

use crate::error::{BlobError, Result};
use arrow::array::{ArrayRef, Int64Array, StringArray, UInt32Array, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use disktree_protocol::{Node, Snapshot};
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

/// Rows per row group. Small enough that a depth-2 view of a huge tree
/// decodes a handful of groups, large enough to keep the footer compact.
pub(crate) const ROW_GROUP_SIZE: usize = 8192;

pub(crate) const META_ROOT_URI: &str = "disktree.root_uri";
pub(crate) const META_COMPLETED_AT: &str = "disktree.completed_at";
pub(crate) const META_ERROR_COUNT: &str = "disktree.error_count";
/// JSON `[[min_depth, max_depth], ...]`, one pair per row group in order.
pub(crate) const META_DEPTH_INDEX: &str = "disktree.depth_index";

pub(crate) fn node_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("uri", DataType::Utf8, false),
        Field::new("kind", DataType::Utf8, false),
        Field::new("size", DataType::UInt64, false),
        Field::new("mtime", DataType::Int64, false),
        Field::new("parent", DataType::Utf8, true),
        Field::new("depth", DataType::UInt32, false),
        Field::new("n_children", DataType::UInt32, false),
        Field::new("n_desc", DataType::UInt64, false),
    ]))
}

/// Write a snapshot to `path` (no atomicity here; the store stages and
/// renames). Nodes are re-sorted so the depth index stays sound even if
/// the caller's ordering drifted.
pub(crate) fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<()> {
    if snapshot.nodes.is_empty() {
        return Err(BlobError::invalid("snapshot has no nodes"));
    }

    let mut nodes: Vec<&Node> = snapshot.nodes.iter().collect();
    nodes.sort_by(|a, b| a.depth.cmp(&b.depth).then_with(|| a.uri.cmp(&b.uri)));

    let schema = node_schema();
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_max_row_group_size(ROW_GROUP_SIZE)
        .build();

    let file = File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, schema.clone(), Some(props))?;

    let mut depth_index: Vec<(u32, u32)> = Vec::new();
    for chunk in nodes.chunks(ROW_GROUP_SIZE) {
        let batch = nodes_to_batch(&schema, chunk)?;
        writer.write(&batch)?;
        // One row group per chunk; record its depth range for pushdown
        writer.flush()?;
        let min_depth = chunk.first().map(|n| n.depth).unwrap_or(0);
        let max_depth = chunk.last().map(|n| n.depth).unwrap_or(0);
        depth_index.push((min_depth, max_depth));
    }

    writer.append_key_value_metadata(KeyValue::new(
        META_ROOT_URI.to_string(),
        snapshot.root_uri.as_str().to_string(),
    ));
    writer.append_key_value_metadata(KeyValue::new(
        META_COMPLETED_AT.to_string(),
        snapshot.completed_at.to_string(),
    ));
    writer.append_key_value_metadata(KeyValue::new(
        META_ERROR_COUNT.to_string(),
        snapshot.error_count.to_string(),
    ));
    writer.append_key_value_metadata(KeyValue::new(
        META_DEPTH_INDEX.to_string(),
        serde_json::to_string(&depth_index)
            .map_err(|e| BlobError::invalid(e.to_string()))?,
    ));

    writer.close()?;
    Ok(())
}

fn nodes_to_batch(schema: &Arc<Schema>, nodes: &[&Node]) -> Result<RecordBatch> {
    let uris: StringArray = nodes.iter().map(|n| Some(n.uri.as_str())).collect();
    let kinds: StringArray = nodes.iter().map(|n| Some(n.kind.as_str())).collect();
    let sizes = UInt64Array::from_iter_values(nodes.iter().map(|n| n.size));
    let mtimes = Int64Array::from_iter_values(nodes.iter().map(|n| n.mtime));
    let parents: StringArray = nodes
        .iter()
        .map(|n| n.parent.as_ref().map(|p| p.as_str()))
        .collect();
    let depths = UInt32Array::from_iter_values(nodes.iter().map(|n| n.depth));
    let n_children = UInt32Array::from_iter_values(nodes.iter().map(|n| n.n_children));
    let n_desc = UInt64Array::from_iter_values(nodes.iter().map(|n| n.n_desc));

    let columns: Vec<ArrayRef> = vec![
        Arc::new(uris),
        Arc::new(kinds),
        Arc::new(sizes),
        Arc::new(mtimes),
        Arc::new(parents),
        Arc::new(depths),
        Arc::new(n_children),
        Arc::new(n_desc),
    ];

    Ok(RecordBatch::try_new(schema.clone(), columns)?)
}
