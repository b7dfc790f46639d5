//! File transfer engines: whole-file, chunked-resumable, and recursive.
//!
//! All engines are blocking (tool handlers run them via `spawn_blocking`)
//! and operate over [`FsEnd`] — one side of a transfer, either the local
//! filesystem or the session's SFTP capability — so a single implementation
//! serves both directions and both session modes.

pub mod chunked;
pub mod file;
pub mod hasher;
pub mod manifest;
pub mod recursive;

use std::io::{Read, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::ssh::sftp::{DirEntry, FileInfo, FileKind, RemoteFile, SftpOps};

/// Cooperative cancellation flag checked at every I/O boundary.
pub type CancelFlag = Arc<AtomicBool>;

/// Fail with `cancelled` if the flag is set.
pub fn check_cancel(cancel: &CancelFlag, what: &str) -> Result<()> {
    if cancel.load(Ordering::Relaxed) {
        Err(Error::Cancelled(what.to_string()))
    } else {
        Ok(())
    }
}

/// One side of a transfer: the local filesystem or a remote SFTP capability.
#[derive(Clone, Copy)]
pub enum FsEnd<'a> {
    Local,
    Remote(&'a dyn SftpOps),
}

fn local_info(meta: &std::fs::Metadata) -> FileInfo {
    let kind = if meta.file_type().is_symlink() {
        FileKind::Symlink
    } else if meta.is_dir() {
        FileKind::Dir
    } else if meta.is_file() {
        FileKind::File
    } else {
        FileKind::Other
    };
    FileInfo {
        size: meta.len(),
        kind,
        perm: meta.permissions().mode() & 0o7777,
        mtime: u64::try_from(meta.mtime()).unwrap_or(0),
        atime: u64::try_from(meta.atime()).unwrap_or(0),
    }
}

impl FsEnd<'_> {
    pub fn is_remote(&self) -> bool {
        matches!(self, FsEnd::Remote(_))
    }

    /// Stat, following symlinks.
    pub fn stat(&self, path: &str) -> Result<FileInfo> {
        match self {
            FsEnd::Local => std::fs::metadata(path)
                .map(|m| local_info(&m))
                .map_err(|e| map_local_stat(path, &e)),
            FsEnd::Remote(sftp) => sftp.stat(path),
        }
    }

    /// Stat without following symlinks.
    pub fn lstat(&self, path: &str) -> Result<FileInfo> {
        match self {
            FsEnd::Local => std::fs::symlink_metadata(path)
                .map(|m| local_info(&m))
                .map_err(|e| map_local_stat(path, &e)),
            FsEnd::Remote(sftp) => sftp.lstat(path),
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.lstat(path).is_ok()
    }

    pub fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        match self {
            FsEnd::Local => {
                let rd = std::fs::read_dir(path).map_err(|e| map_local_stat(path, &e))?;
                let mut entries = Vec::new();
                for item in rd {
                    let item = item.map_err(|e| Error::local(path, &e))?;
                    let Some(name) = item.file_name().to_str().map(ToString::to_string) else {
                        continue;
                    };
                    let meta = item
                        .path()
                        .symlink_metadata()
                        .map_err(|e| Error::local(path, &e))?;
                    entries.push(DirEntry {
                        name,
                        info: local_info(&meta),
                    });
                }
                entries.sort_by(|a, b| a.name.cmp(&b.name));
                Ok(entries)
            }
            FsEnd::Remote(sftp) => sftp.read_dir(path),
        }
    }

    pub fn read_link(&self, path: &str) -> Result<String> {
        match self {
            FsEnd::Local => std::fs::read_link(path)
                .map(|p| p.to_string_lossy().into_owned())
                .map_err(|e| Error::local(path, &e)),
            FsEnd::Remote(sftp) => sftp.read_link(path),
        }
    }

    pub fn symlink(&self, target: &str, link: &str) -> Result<()> {
        match self {
            FsEnd::Local => {
                std::os::unix::fs::symlink(target, link).map_err(|e| Error::local(link, &e))
            }
            FsEnd::Remote(sftp) => sftp.symlink(target, link),
        }
    }

    pub fn mkdir_all(&self, path: &str, mode: u32) -> Result<()> {
        match self {
            FsEnd::Local => {
                std::fs::create_dir_all(path).map_err(|e| Error::local(path, &e))?;
                Ok(())
            }
            FsEnd::Remote(sftp) => sftp.mkdir_all(path, mode),
        }
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        match self {
            FsEnd::Local => std::fs::rename(from, to).map_err(|e| Error::local(from, &e)),
            FsEnd::Remote(sftp) => sftp.rename(from, to),
        }
    }

    pub fn remove(&self, path: &str) -> Result<()> {
        match self {
            FsEnd::Local => std::fs::remove_file(path).map_err(|e| Error::local(path, &e)),
            FsEnd::Remote(sftp) => sftp.remove(path),
        }
    }

    /// Set atime/mtime (seconds since epoch).
    pub fn set_times(&self, path: &str, atime: u64, mtime: u64) -> Result<()> {
        match self {
            FsEnd::Local => {
                let to_tv = |secs: u64| {
                    nix::sys::time::TimeVal::new(
                        i64::try_from(secs).unwrap_or(0),
                        0,
                    )
                };
                nix::sys::stat::utimes(Path::new(path), &to_tv(atime), &to_tv(mtime))
                    .map_err(|e| Error::LocalIo(format!("{path}: utimes: {e}")))
            }
            FsEnd::Remote(sftp) => sftp.chtimes(path, atime, mtime),
        }
    }

    pub fn open_read(&self, path: &str) -> Result<Box<dyn RemoteFile>> {
        match self {
            FsEnd::Local => {
                let f = std::fs::File::open(path).map_err(|e| map_local_stat(path, &e))?;
                Ok(Box::new(f))
            }
            FsEnd::Remote(sftp) => sftp.open_read(path),
        }
    }

    pub fn open_write(&self, path: &str, mode: u32, truncate: bool) -> Result<Box<dyn RemoteFile>> {
        match self {
            FsEnd::Local => {
                let mut opts = std::fs::OpenOptions::new();
                opts.write(true).read(true).create(true).mode(mode);
                if truncate {
                    opts.truncate(true);
                }
                let f = opts.open(path).map_err(|e| Error::local(path, &e))?;
                Ok(Box::new(f))
            }
            FsEnd::Remote(sftp) => sftp.open_write(path, mode, truncate),
        }
    }

    /// Wrap an I/O error with the right taxonomy for this end.
    pub fn io_error(&self, path: &str, err: &std::io::Error) -> Error {
        match self {
            FsEnd::Local => Error::local(path, err),
            FsEnd::Remote(_) => Error::remote(path, err),
        }
    }
}

fn map_local_stat(path: &str, e: &std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::NotFound(format!("path not found: {path}"))
    } else {
        Error::local(path, e)
    }
}

/// Copy `reader` → `writer` in 64 KiB blocks, hashing the bytes and checking
/// cancellation between blocks. Errors are attributed to the side that
/// failed. Returns `(bytes_copied, sha256_hex)`.
pub fn copy_hashed(
    mut reader: impl Read,
    mut writer: impl Write,
    cancel: &CancelFlag,
    src: (&FsEnd<'_>, &str),
    dst: (&FsEnd<'_>, &str),
) -> Result<(u64, String)> {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        check_cancel(cancel, src.1)?;
        let n = reader.read(&mut buf).map_err(|e| src.0.io_error(src.1, &e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        writer
            .write_all(&buf[..n])
            .map_err(|e| dst.0.io_error(dst.1, &e))?;
        total += n as u64;
    }
    writer.flush().map_err(|e| dst.0.io_error(dst.1, &e))?;
    Ok((total, hex::encode(hasher.finalize())))
}

