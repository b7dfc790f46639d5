//! Chunked, resumable file transfers (SSH sessions only).
//!
//! The file is split into fixed-size chunks; each chunk is read at its
//! offset, SHA-256-checksummed, written at the same offset on the other
//! side, and marked complete in the on-disk manifest. The manifest is
//! flushed every ten chunks and at the end, so an interrupted transfer
//! resumes from the first incomplete chunk without retransmitting verified
//! bytes. Chunk I/O is strictly sequential — no parallelism within a
//! transfer.

use std::io::{Read, Seek, Write};
use std::os::unix::fs::FileExt;

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::ssh::sftp::SftpOps;
use crate::transfer::manifest::{Direction, TransferManifest};
use crate::transfer::{check_cancel, hasher, CancelFlag};

/// Flush the manifest after this many newly completed chunks.
const FLUSH_EVERY: u32 = 10;

/// Result of a chunked transfer run (fresh or resumed).
#[derive(Debug, Serialize)]
pub struct TransferOutcome {
    pub status: &'static str,
    pub manifest_path: String,
    pub chunks_completed: u32,
    pub total_chunks: u32,
    pub bytes_transferred: u64,
    pub progress_percent: f64,
    pub bytes_per_second: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_checksum: Option<String>,
}

/// Result of `shell_transfer_status` — derived from the manifest alone.
#[derive(Debug, Serialize)]
pub struct TransferStatus {
    pub status: &'static str,
    pub direction: Direction,
    pub remote_path: String,
    pub local_path: String,
    pub chunks_completed: u32,
    pub total_chunks: u32,
    pub bytes_transferred: u64,
    pub total_size: u64,
    pub progress_percent: f64,
}

/// Start a chunked download: plan the manifest, pre-allocate the local
/// file, and run the chunk loop.
pub fn start_get(
    sftp: &dyn SftpOps,
    remote_path: &str,
    local_path: &str,
    session_id: &str,
    chunk_size: u64,
    cancel: &CancelFlag,
) -> Result<TransferOutcome> {
    let info = sftp.stat(remote_path)?;
    if info.is_dir() {
        return Err(Error::PreconditionFailed(format!(
            "remote_path is a directory: {remote_path}"
        )));
    }

    let manifest = TransferManifest::plan(
        Direction::Get,
        remote_path,
        local_path,
        session_id,
        info.size,
        chunk_size,
    );
    let manifest_path = TransferManifest::path_for(local_path);

    if let Some(parent) = std::path::Path::new(local_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| Error::local(local_path, &e))?;
        }
    }
    // Pre-allocate so chunk writes never grow the file.
    let local = std::fs::File::create(local_path).map_err(|e| Error::local(local_path, &e))?;
    local
        .set_len(info.size)
        .map_err(|e| Error::local(local_path, &e))?;
    drop(local);

    manifest.save(&manifest_path)?;
    info!(
        "chunked get {remote_path} -> {local_path} ({} bytes, {} chunks)",
        info.size, manifest.total_chunks
    );
    run(sftp, manifest, &manifest_path, cancel)
}

/// Start a chunked upload.
pub fn start_put(
    sftp: &dyn SftpOps,
    local_path: &str,
    remote_path: &str,
    session_id: &str,
    chunk_size: u64,
    cancel: &CancelFlag,
) -> Result<TransferOutcome> {
    let meta = std::fs::metadata(local_path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound(format!("local_path not found: {local_path}"))
        } else {
            Error::local(local_path, &e)
        }
    })?;
    if meta.is_dir() {
        return Err(Error::PreconditionFailed(format!(
            "local_path is a directory: {local_path}"
        )));
    }

    let manifest = TransferManifest::plan(
        Direction::Put,
        remote_path,
        local_path,
        session_id,
        meta.len(),
        chunk_size,
    );
    let manifest_path = TransferManifest::path_for(local_path);

    if let Some(idx) = remote_path.trim_end_matches('/').rfind('/') {
        if idx > 0 {
            sftp.mkdir_all(&remote_path[..idx], 0o755)?;
        }
    }
    // Truncate the remote destination so stale bytes from a previous file
    // can't survive past the chunk offsets.
    drop(sftp.open_write(remote_path, 0o644, true)?);

    manifest.save(&manifest_path)?;
    info!(
        "chunked put {local_path} -> {remote_path} ({} bytes, {} chunks)",
        meta.len(),
        manifest.total_chunks
    );
    run(sftp, manifest, &manifest_path, cancel)
}

/// Resume from a manifest: recompute `bytes_sent` from completed chunks
/// (correcting drift from a death between completion and flush), reopen the
/// files without truncation, and re-enter the chunk loop skipping completed
/// chunks. Checksums of completed chunks are preserved verbatim.
pub fn resume(
    sftp: &dyn SftpOps,
    manifest_path: &str,
    cancel: &CancelFlag,
) -> Result<TransferOutcome> {
    let mut manifest = TransferManifest::load(manifest_path)?;
    let recomputed = manifest.recompute_bytes_sent();
    if recomputed != manifest.bytes_sent {
        debug!(
            "manifest {manifest_path}: correcting bytes_sent {} -> {recomputed}",
            manifest.bytes_sent
        );
        manifest.bytes_sent = recomputed;
    }
    info!(
        "resuming transfer from {manifest_path} ({}/{} chunks done)",
        manifest.completed_chunks(),
        manifest.total_chunks
    );
    run(sftp, manifest, manifest_path, cancel)
}

/// Status from the manifest alone — no session required.
pub fn status(manifest_path: &str) -> Result<TransferStatus> {
    let manifest = TransferManifest::load(manifest_path)?;
    let completed = manifest.completed_chunks();
    Ok(TransferStatus {
        status: if manifest.is_complete() {
            "completed"
        } else {
            "in_progress"
        },
        direction: manifest.direction,
        remote_path: manifest.remote_path.clone(),
        local_path: manifest.local_path.clone(),
        chunks_completed: completed,
        total_chunks: manifest.total_chunks,
        bytes_transferred: manifest.bytes_sent,
        total_size: manifest.total_size,
        progress_percent: manifest.progress_percent(),
    })
}

/// The sequential chunk loop shared by fresh starts and resumes.
fn run(
    sftp: &dyn SftpOps,
    mut manifest: TransferManifest,
    manifest_path: &str,
    cancel: &CancelFlag,
) -> Result<TransferOutcome> {
    let direction = manifest.direction;
    let local_path = manifest.local_path.clone();
    let remote_path = manifest.remote_path.clone();

    // Local side: positional I/O via read_at/write_at.
    let local = match direction {
        Direction::Get => std::fs::OpenOptions::new()
            .write(true)
            .open(&local_path)
            .map_err(|e| Error::local(&local_path, &e))?,
        Direction::Put => {
            std::fs::File::open(&local_path).map_err(|e| Error::local(&local_path, &e))?
        }
    };

    // Remote side: one seekable stream for the whole run.
    let mut remote = match direction {
        Direction::Get => sftp.open_read(&remote_path)?,
        Direction::Put => sftp.open_write(&remote_path, 0o644, false)?,
    };

    let mut since_flush = 0u32;
    let total_chunks = manifest.total_chunks;
    let last_index = total_chunks.saturating_sub(1);

    for i in 0..manifest.chunks.len() {
        if manifest.chunks[i].completed {
            continue;
        }
        let (index, offset, size) = {
            let c = &manifest.chunks[i];
            (c.index, c.offset, c.size)
        };

        if let Err(e) = check_cancel(cancel, &format!("chunk {index}")) {
            manifest.save(manifest_path)?;
            return Err(e);
        }

        let result = match direction {
            Direction::Get => {
                transfer_chunk_get(&mut remote, &local, offset, size, index == last_index)
            }
            Direction::Put => transfer_chunk_put(&local, &mut remote, offset, size),
        };

        let (chunk_bytes, checksum) = match result {
            Ok(v) => v,
            Err(e) => {
                // Record what we have so a later resume can pick up here.
                manifest.save(manifest_path)?;
                return Err(wrap_chunk_error(index, e));
            }
        };

        let chunk = &mut manifest.chunks[i];
        chunk.checksum = Some(checksum);
        chunk.completed = true;
        manifest.bytes_sent += chunk_bytes;
        manifest.last_updated_at = crate::util::now_ms();

        since_flush += 1;
        if since_flush >= FLUSH_EVERY {
            manifest.save(manifest_path)?;
            since_flush = 0;
        }
    }

    // Completion: whole-file checksum over the local side.
    manifest.file_checksum = Some(
        hasher::hash_file(std::path::Path::new(&local_path))
            .map_err(|e| Error::local(&local_path, &e))?,
    );
    manifest.finalize();
    manifest.save(manifest_path)?;

    info!(
        "chunked {} complete: {} bytes in {} chunks",
        match direction {
            Direction::Get => "get",
            Direction::Put => "put",
        },
        manifest.bytes_sent,
        total_chunks
    );

    Ok(TransferOutcome {
        status: "completed",
        manifest_path: manifest_path.to_string(),
        chunks_completed: manifest.completed_chunks(),
        total_chunks,
        bytes_transferred: manifest.bytes_sent,
        progress_percent: manifest.progress_percent(),
        bytes_per_second: manifest.bytes_per_second.unwrap_or(0),
        file_checksum: manifest.file_checksum.clone(),
    })
}

fn wrap_chunk_error(index: u32, e: Error) -> Error {
    let msg = format!("chunk {index} failed: {e}");
    match e {
        Error::Cancelled(_) => Error::Cancelled(msg),
        Error::LocalIo(_) => Error::LocalIo(msg),
        _ => Error::RemoteIo(msg),
    }
}

/// Download one chunk: seek remote, read `size` bytes (short read tolerated
/// only on the last chunk), hash, write at the local offset.
fn transfer_chunk_get(
    remote: &mut Box<dyn crate::ssh::sftp::RemoteFile>,
    local: &std::fs::File,
    offset: u64,
    size: u64,
    is_last: bool,
) -> Result<(u64, String)> {
    remote
        .seek(std::io::SeekFrom::Start(offset))
        .map_err(|e| Error::RemoteIo(format!("seek to {offset}: {e}")))?;

    let mut data = vec![0u8; size as usize];
    let mut filled = 0usize;
    while filled < data.len() {
        match remote.read(&mut data[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) => return Err(Error::RemoteIo(format!("read at {offset}: {e}"))),
        }
    }
    if filled < data.len() && !is_last {
        return Err(Error::RemoteIo(format!(
            "short read at offset {offset}: got {filled} of {size} bytes"
        )));
    }
    data.truncate(filled);

    let checksum = hasher::hash_bytes(&data);
    local
        .write_all_at(&data, offset)
        .map_err(|e| Error::LocalIo(format!("write at {offset}: {e}")))?;
    Ok((data.len() as u64, checksum))
}

/// Upload one chunk: read at the local offset, hash, seek remote, write.
fn transfer_chunk_put(
    local: &std::fs::File,
    remote: &mut Box<dyn crate::ssh::sftp::RemoteFile>,
    offset: u64,
    size: u64,
) -> Result<(u64, String)> {
    let mut data = vec![0u8; size as usize];
    local
        .read_exact_at(&mut data, offset)
        .map_err(|e| Error::LocalIo(format!("read at {offset}: {e}")))?;

    let checksum = hasher::hash_bytes(&data);
    remote
        .seek(std::io::SeekFrom::Start(offset))
        .map_err(|e| Error::RemoteIo(format!("seek to {offset}: {e}")))?;
    remote
        .write_all(&data)
        .map_err(|e| Error::RemoteIo(format!("write at {offset}: {e}")))?;
    remote
        .flush()
        .map_err(|e| Error::RemoteIo(format!("flush at {offset}: {e}")))?;
    Ok((data.len() as u64, checksum))
}
