//! Whole-file transfers: stat/get/put/mv with checksum, atomic rename, and
//! optional timestamp preservation and gzip.
//!
//! Writes go to a `.part` temp file on the destination side and are renamed
//! into place only after the copy (and checksum verification, when an
//! expected checksum was given) succeeds, so a failed transfer never leaves
//! a torn destination.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use tracing::info;

use crate::error::{Error, Result};
use crate::transfer::{check_cancel, copy_hashed, CancelFlag, FsEnd};
use crate::util;

/// Options shared by get and put.
#[derive(Debug, Clone, Default)]
pub struct FileTransferOptions {
    pub overwrite: bool,
    pub preserve_times: bool,
    /// get: write the destination gzip-compressed.
    /// put: treat the local source as gzip and decompress while writing.
    pub compress: bool,
    /// When set, the transfer fails with `checksum_mismatch` unless the
    /// source bytes hash to this value.
    pub expected_checksum: Option<String>,
}

/// Result payload for `shell_file_get` / `shell_file_put`.
#[derive(Debug, Serialize)]
pub struct FileOpResult {
    pub source: String,
    pub destination: String,
    pub bytes: u64,
    /// SHA-256 of the transferred (uncompressed) payload.
    pub checksum: String,
    pub duration_ms: u64,
}

/// Copy `src_path` on `src` to `dst_path` on `dst`.
///
/// This single function implements both `shell_file_get` (src = remote) and
/// `shell_file_put` (dst = remote); on local sessions both ends are local.
pub fn copy_file(
    src: &FsEnd<'_>,
    src_path: &str,
    dst: &FsEnd<'_>,
    dst_path: &str,
    opts: &FileTransferOptions,
    cancel: &CancelFlag,
) -> Result<FileOpResult> {
    let started = util::now_ms();

    let info = src.stat(src_path)?;
    if info.is_dir() {
        return Err(Error::PreconditionFailed(format!(
            "source is a directory, not a file: {src_path}"
        )));
    }
    if dst.exists(dst_path) && !opts.overwrite {
        return Err(Error::PreconditionFailed(format!(
            "destination exists and overwrite is not set: {dst_path}"
        )));
    }
    check_cancel(cancel, src_path)?;

    if let Some(parent) = parent_dir(dst_path) {
        dst.mkdir_all(&parent, 0o755)?;
    }

    let reader = src.open_read(src_path)?;
    let part_path = format!("{dst_path}.part");
    let mode = if info.perm == 0 { 0o644 } else { info.perm };
    let writer = dst.open_write(&part_path, mode, true)?;

    // The checksum always covers the logical payload (uncompressed bytes),
    // so it is comparable across compressed and plain transfers.
    let copy_result = if opts.compress && !src.is_remote() && dst.is_remote() {
        // put with compress: gzip local source, plain remote destination.
        let decoder = GzDecoder::new(reader);
        copy_hashed(decoder, writer, cancel, (src, src_path), (dst, dst_path))
    } else if opts.compress {
        // get (or local copy) with compress: gzip the destination. The
        // trailer must be written explicitly — Drop would swallow errors.
        let mut encoder = GzEncoder::new(writer, Compression::default());
        copy_hashed(reader, &mut encoder, cancel, (src, src_path), (dst, dst_path)).and_then(
            |ok| {
                encoder
                    .finish()
                    .map(|_| ok)
                    .map_err(|e| dst.io_error(dst_path, &e))
            },
        )
    } else {
        copy_hashed(reader, writer, cancel, (src, src_path), (dst, dst_path))
    };

    let (bytes, checksum) = match copy_result {
        Ok(v) => v,
        Err(e) => {
            let _ = dst.remove(&part_path);
            return Err(e);
        }
    };

    if let Some(ref expected) = opts.expected_checksum {
        if !expected.eq_ignore_ascii_case(&checksum) {
            let _ = dst.remove(&part_path);
            return Err(Error::ChecksumMismatch(format!(
                "{src_path}: expected {expected}, computed {checksum}"
            )));
        }
    }

    // Atomic move into place.
    if let Err(e) = dst.rename(&part_path, dst_path) {
        let _ = dst.remove(&part_path);
        return Err(e);
    }

    if opts.preserve_times && info.mtime > 0 {
        // Best-effort: some servers reject setstat on fresh files.
        let _ = dst.set_times(dst_path, info.atime, info.mtime);
    }

    let duration_ms = util::now_ms().saturating_sub(started);
    info!("copied {src_path} -> {dst_path} ({bytes} bytes)");
    Ok(FileOpResult {
        source: src_path.to_string(),
        destination: dst_path.to_string(),
        bytes,
        checksum,
        duration_ms,
    })
}

/// Rename/move a file on one end (`shell_file_mv`).
pub fn move_file(
    end: &FsEnd<'_>,
    from: &str,
    to: &str,
    overwrite: bool,
) -> Result<FileOpResult> {
    let started = util::now_ms();
    let info = end.lstat(from)?;
    if end.exists(to) && !overwrite {
        return Err(Error::PreconditionFailed(format!(
            "destination exists and overwrite is not set: {to}"
        )));
    }
    if let Some(parent) = parent_dir(to) {
        end.mkdir_all(&parent, 0o755)?;
    }
    end.rename(from, to)?;
    info!("moved {from} -> {to}");
    Ok(FileOpResult {
        source: from.to_string(),
        destination: to.to_string(),
        bytes: info.size,
        checksum: String::new(),
        duration_ms: util::now_ms().saturating_sub(started),
    })
}

fn parent_dir(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    if idx == 0 {
        return None; // parent is the root
    }
    Some(trimmed[..idx].to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use super::*;
    use crate::ssh::sftp::fake::FakeSftp;
    use crate::ssh::sftp::SftpOps;
    use crate::transfer::hasher;

    fn no_cancel() -> CancelFlag {
        Arc::new(AtomicBool::new(false))
    }

    #[test]
    fn get_roundtrip_with_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let sftp = FakeSftp::new();
        sftp.add_file("/srv/a.txt", b"file contents");

        let dst = dir.path().join("a.txt").to_string_lossy().into_owned();
        let result = copy_file(
            &FsEnd::Remote(&sftp),
            "/srv/a.txt",
            &FsEnd::Local,
            &dst,
            &FileTransferOptions::default(),
            &no_cancel(),
        )
        .unwrap();

        assert_eq!(result.bytes, 13);
        assert_eq!(result.checksum, hasher::hash_bytes(b"file contents"));
        assert_eq!(std::fs::read(&dst).unwrap(), b"file contents");
        // No .part leftover.
        assert!(!std::path::Path::new(&format!("{dst}.part")).exists());
    }

    #[test]
    fn put_then_get_returns_original_data() {
        let dir = tempfile::tempdir().unwrap();
        let sftp = FakeSftp::new();
        let data = b"round trip payload".to_vec();
        let src = dir.path().join("src.bin").to_string_lossy().into_owned();
        std::fs::write(&src, &data).unwrap();

        copy_file(
            &FsEnd::Local,
            &src,
            &FsEnd::Remote(&sftp),
            "/srv/up.bin",
            &FileTransferOptions::default(),
            &no_cancel(),
        )
        .unwrap();

        let back = dir.path().join("back.bin").to_string_lossy().into_owned();
        copy_file(
            &FsEnd::Remote(&sftp),
            "/srv/up.bin",
            &FsEnd::Local,
            &back,
            &FileTransferOptions::default(),
            &no_cancel(),
        )
        .unwrap();
        assert_eq!(std::fs::read(&back).unwrap(), data);
    }

    #[test]
    fn overwrite_guard() {
        let dir = tempfile::tempdir().unwrap();
        let sftp = FakeSftp::new();
        sftp.add_file("/srv/a", b"new");
        let dst = dir.path().join("a").to_string_lossy().into_owned();
        std::fs::write(&dst, b"old").unwrap();

        let err = copy_file(
            &FsEnd::Remote(&sftp),
            "/srv/a",
            &FsEnd::Local,
            &dst,
            &FileTransferOptions::default(),
            &no_cancel(),
        )
        .unwrap_err();
        assert_eq!(err.code(), "precondition_failed");
        assert_eq!(std::fs::read(&dst).unwrap(), b"old");

        let result = copy_file(
            &FsEnd::Remote(&sftp),
            "/srv/a",
            &FsEnd::Local,
            &dst,
            &FileTransferOptions {
                overwrite: true,
                ..Default::default()
            },
            &no_cancel(),
        )
        .unwrap();
        assert_eq!(result.bytes, 3);
        assert_eq!(std::fs::read(&dst).unwrap(), b"new");
    }

    #[test]
    fn checksum_mismatch_removes_partial() {
        let dir = tempfile::tempdir().unwrap();
        let sftp = FakeSftp::new();
        sftp.add_file("/srv/a", b"data");
        let dst = dir.path().join("a").to_string_lossy().into_owned();

        let err = copy_file(
            &FsEnd::Remote(&sftp),
            "/srv/a",
            &FsEnd::Local,
            &dst,
            &FileTransferOptions {
                expected_checksum: Some("00".repeat(32)),
                ..Default::default()
            },
            &no_cancel(),
        )
        .unwrap_err();
        assert_eq!(err.code(), "checksum_mismatch");
        assert!(!std::path::Path::new(&dst).exists());
        assert!(!std::path::Path::new(&format!("{dst}.part")).exists());
    }

    #[test]
    fn source_directory_rejected() {
        let sftp = FakeSftp::new();
        sftp.add_dir("/srv/d");
        let err = copy_file(
            &FsEnd::Remote(&sftp),
            "/srv/d",
            &FsEnd::Local,
            "/tmp/never",
            &FileTransferOptions::default(),
            &no_cancel(),
        )
        .unwrap_err();
        assert_eq!(err.code(), "precondition_failed");
    }

    #[test]
    fn missing_source_is_not_found() {
        let sftp = FakeSftp::new();
        let err = copy_file(
            &FsEnd::Remote(&sftp),
            "/srv/missing",
            &FsEnd::Local,
            "/tmp/never",
            &FileTransferOptions::default(),
            &no_cancel(),
        )
        .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn compressed_get_gunzips_back_to_source() {
        let dir = tempfile::tempdir().unwrap();
        let sftp = FakeSftp::new();
        let data = vec![42u8; 10_000];
        sftp.add_file("/srv/big", &data);

        let dst = dir.path().join("big.gz").to_string_lossy().into_owned();
        let result = copy_file(
            &FsEnd::Remote(&sftp),
            "/srv/big",
            &FsEnd::Local,
            &dst,
            &FileTransferOptions {
                compress: true,
                ..Default::default()
            },
            &no_cancel(),
        )
        .unwrap();
        // Checksum covers the logical payload.
        assert_eq!(result.checksum, hasher::hash_bytes(&data));

        let gz = std::fs::File::open(&dst).unwrap();
        let mut decoded = Vec::new();
        std::io::Read::read_to_end(&mut GzDecoder::new(gz), &mut decoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn compressed_put_decompresses_to_remote() {
        let dir = tempfile::tempdir().unwrap();
        let sftp = FakeSftp::new();
        let data = b"compressed payload".to_vec();
        let src = dir.path().join("src.gz").to_string_lossy().into_owned();
        {
            let f = std::fs::File::create(&src).unwrap();
            let mut enc = GzEncoder::new(f, Compression::default());
            std::io::Write::write_all(&mut enc, &data).unwrap();
            enc.finish().unwrap();
        }

        copy_file(
            &FsEnd::Local,
            &src,
            &FsEnd::Remote(&sftp),
            "/srv/plain.txt",
            &FileTransferOptions {
                compress: true,
                ..Default::default()
            },
            &no_cancel(),
        )
        .unwrap();
        assert_eq!(sftp.file_data("/srv/plain.txt").unwrap(), data);
    }

    #[test]
    fn preserve_times() {
        let dir = tempfile::tempdir().unwrap();
        let sftp = FakeSftp::new();
        let src = dir.path().join("t.txt").to_string_lossy().into_owned();
        std::fs::write(&src, b"x").unwrap();

        copy_file(
            &FsEnd::Local,
            &src,
            &FsEnd::Remote(&sftp),
            "/srv/t.txt",
            &FileTransferOptions {
                preserve_times: true,
                ..Default::default()
            },
            &no_cancel(),
        )
        .unwrap();
        let local_mtime = FsEnd::Local.stat(&src).unwrap().mtime;
        assert_eq!(sftp.stat("/srv/t.txt").unwrap().mtime, local_mtime);
    }

    #[test]
    fn move_file_renames() {
        let sftp = FakeSftp::new();
        sftp.add_file("/srv/old", b"payload");
        let result = move_file(&FsEnd::Remote(&sftp), "/srv/old", "/srv/new", false).unwrap();
        assert_eq!(result.bytes, 7);
        assert!(sftp.file_data("/srv/old").is_none());
        assert_eq!(sftp.file_data("/srv/new").unwrap(), b"payload");
    }

    #[test]
    fn move_file_overwrite_guard() {
        let sftp = FakeSftp::new();
        sftp.add_file("/srv/a", b"1");
        sftp.add_file("/srv/b", b"2");
        let err = move_file(&FsEnd::Remote(&sftp), "/srv/a", "/srv/b", false).unwrap_err();
        assert_eq!(err.code(), "precondition_failed");
    }
}
