//! On-disk manifest of a chunked, resumable transfer.
//!
//! Persisted as JSON next to the local file with suffix `.transfer`. The
//! manifest records the full chunk plan plus progress, so an interrupted
//! transfer can resume from the first incomplete chunk without
//! retransmitting verified bytes.
//!
//! Invariants maintained by every flush:
//! - `chunks.len() == total_chunks`
//! - `Σ chunks[i].size == total_size`
//! - `chunks[i].offset == Σ_{j<i} chunks[j].size`
//! - `bytes_sent == Σ_{completed} chunks[i].size`

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util;

/// Manifest file suffix, appended to the local path.
pub const MANIFEST_SUFFIX: &str = ".transfer";

/// Bounds for the chunk size; defaults come from config.
pub const MIN_CHUNK_SIZE: u64 = 1024;
pub const MAX_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

/// Transfer direction, from the local process's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Remote → local.
    Get,
    /// Local → remote.
    Put,
}

/// One contiguous byte range, transferred and checksummed as a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub index: u32,
    pub offset: u64,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub completed: bool,
}

/// The persisted transfer record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferManifest {
    pub version: u32,
    pub direction: Direction,
    pub remote_path: String,
    pub local_path: String,
    pub session_id: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub started_at: u64,
    pub last_updated_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
    pub bytes_sent: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_per_second: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_checksum: Option<String>,
    pub chunks: Vec<ChunkInfo>,
}

/// Clamp a requested chunk size into `[1 KiB, 10 MiB]`.
pub fn clamp_chunk_size(requested: u64) -> u64 {
    requested.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
}

/// Total chunks for a file. Empty files still get one (empty) chunk so the
/// plan is never degenerate.
pub fn compute_chunks(total_size: u64, chunk_size: u64) -> u32 {
    if total_size == 0 {
        return 1;
    }
    total_size.div_ceil(chunk_size) as u32
}

impl TransferManifest {
    /// Build the initial plan: one `ChunkInfo` per index, nothing completed.
    pub fn plan(
        direction: Direction,
        remote_path: &str,
        local_path: &str,
        session_id: &str,
        total_size: u64,
        chunk_size: u64,
    ) -> Self {
        let chunk_size = clamp_chunk_size(chunk_size);
        let total_chunks = compute_chunks(total_size, chunk_size);
        let now = util::now_ms();

        let chunks = (0..total_chunks)
            .map(|index| {
                let offset = u64::from(index) * chunk_size;
                ChunkInfo {
                    index,
                    offset,
                    size: std::cmp::min(chunk_size, total_size.saturating_sub(offset)),
                    checksum: None,
                    completed: false,
                }
            })
            .collect();

        Self {
            version: 1,
            direction,
            remote_path: remote_path.to_string(),
            local_path: local_path.to_string(),
            session_id: session_id.to_string(),
            total_size,
            chunk_size,
            total_chunks,
            started_at: now,
            last_updated_at: now,
            completed_at: None,
            bytes_sent: 0,
            bytes_per_second: None,
            file_checksum: None,
            chunks,
        }
    }

    /// Manifest path for a local file path.
    pub fn path_for(local_path: &str) -> String {
        format!("{local_path}{MANIFEST_SUFFIX}")
    }

    pub fn load(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(format!("manifest not found: {path}"))
            } else {
                Error::local(path, &e)
            }
        })?;
        let manifest: TransferManifest = serde_json::from_str(&text)
            .map_err(|e| Error::LocalIo(format!("manifest parse {path}: {e}")))?;
        if manifest.chunks.len() != manifest.total_chunks as usize {
            return Err(Error::LocalIo(format!(
                "manifest {path} is inconsistent: {} chunks recorded, {} expected",
                manifest.chunks.len(),
                manifest.total_chunks
            )));
        }
        Ok(manifest)
    }

    /// Atomically persist the manifest (write temp, rename). Failures here
    /// are fatal to the transfer — progress could not be recorded.
    pub fn save(&self, path: &str) -> Result<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Internal(format!("manifest serialize: {e}")))?;
        let tmp = format!("{path}.tmp");
        std::fs::write(&tmp, text).map_err(|e| Error::local(&tmp, &e))?;
        std::fs::rename(&tmp, path).map_err(|e| Error::local(path, &e))?;
        Ok(())
    }

    pub fn completed_chunks(&self) -> u32 {
        self.chunks.iter().filter(|c| c.completed).count() as u32
    }

    /// Sum of completed chunk sizes — the authoritative `bytes_sent`,
    /// recomputed on resume to correct mid-run accounting drift.
    pub fn recompute_bytes_sent(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|c| c.completed)
            .map(|c| c.size)
            .sum()
    }

    pub fn is_complete(&self) -> bool {
        self.completed_chunks() == self.total_chunks
    }

    /// Progress in percent. 0 for an empty total unless all chunks are done.
    pub fn progress_percent(&self) -> f64 {
        if self.is_complete() {
            return 100.0;
        }
        if self.total_size == 0 {
            return 0.0;
        }
        (self.bytes_sent as f64 / self.total_size as f64) * 100.0
    }

    /// Mark completion and compute the transfer rate.
    pub fn finalize(&mut self) {
        let now = util::now_ms();
        self.last_updated_at = now;
        self.completed_at = Some(now);
        let elapsed_ms = now.saturating_sub(self.started_at);
        self.bytes_per_second = Some(if elapsed_ms == 0 {
            0
        } else {
            self.bytes_sent * 1000 / elapsed_ms
        });
    }

    #[cfg(test)]
    pub fn assert_invariants(&self) {
        assert_eq!(self.chunks.len(), self.total_chunks as usize);
        assert_eq!(
            self.chunks.iter().map(|c| c.size).sum::<u64>(),
            self.total_size
        );
        let mut expected_offset = 0;
        for chunk in &self.chunks {
            assert_eq!(chunk.offset, expected_offset);
            expected_offset += chunk.size;
        }
        assert_eq!(self.bytes_sent, self.recompute_bytes_sent());
    }
}
