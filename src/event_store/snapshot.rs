//! Snapshot files: `[u64 big-endian log_offset][serde_json AggregateRoot]`
//!
//! `log_offset` is the event file length at the time the snapshot was taken;
//! loading replays only the records after it.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::aggregate::{Aggregate, AggregateRoot};
use crate::error::{Error, Result};
use crate::utils::atomic_write_with;

/// Size of the offset header
const OFFSET_LEN: usize = 8;

/// Where a snapshot was taken
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub id: String,
    /// Event file length covered by the snapshot
    pub log_offset: u64,
}

/// Atomically replace the snapshot at `path`
pub(crate) fn write_snapshot<A: Aggregate>(
    path: &Path,
    root: &AggregateRoot<A>,
    log_offset: u64,
) -> Result<()> {
    let body = serde_json::to_vec(root)?;
    atomic_write_with(path, |file| {
        file.write_all(&log_offset.to_be_bytes())?;
        file.write_all(&body)
    })?;
    Ok(())
}

/// Read a snapshot; `None` if the file does not exist
pub(crate) fn read_snapshot<A: Aggregate>(
    path: &Path,
    id: &str,
) -> Result<Option<(u64, AggregateRoot<A>)>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if bytes.len() < OFFSET_LEN {
        return Err(Error::corrupted(
            id,
            format!("snapshot is {} bytes, shorter than its header", bytes.len()),
        ));
    }

    let (header, body) = bytes.split_at(OFFSET_LEN);
    let mut offset = [0u8; OFFSET_LEN];
    offset.copy_from_slice(header);
    let log_offset = u64::from_be_bytes(offset);

    let root: AggregateRoot<A> = serde_json::from_slice(body)
        .map_err(|e| Error::corrupted(id, format!("snapshot body: {e}")))?;
    if root.id() != id {
        return Err(Error::corrupted(
            id,
            format!("snapshot belongs to aggregate {}", root.id()),
        ));
    }

    Ok(Some((log_offset, root)))
}
