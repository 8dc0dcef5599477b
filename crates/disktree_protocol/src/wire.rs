//! Wire protocol between the scan worker and its supervisor.
//!
//! Frames flow over the worker's stdout as length-prefixed bincode:
//! a little-endian `u32` length followed by the payload. stderr is left
//! free for logging.

use crate::types::ErrorKind;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressWire {
    pub items_found: u64,
    pub error_count: u64,
    pub items_per_sec: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathErrorWire {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoneWire {
    /// Catalog id of the committed scan row.
    pub scan_id: i64,
    pub items_found: u64,
    pub error_count: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FatalWire {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireFrame {
    Progress(ProgressWire),
    PathError(PathErrorWire),
    Done(DoneWire),
    Fatal(FatalWire),
}

pub fn write_frame<W: Write>(writer: &mut W, frame: &WireFrame) -> std::io::Result<()> {
    let payload = bincode::serialize(frame)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "frame too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

pub fn read_frame<R: Read>(reader: &mut R) -> std::io::Result<Option<WireFrame>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    let frame = bincode::deserialize(&payload)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(frame))
}

/// Async variant used by the scheduler on the worker's piped stdout.
pub async fn read_frame_async<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<WireFrame>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    let frame = bincode::deserialize(&payload)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(frame))
}
