//! Recursive directory transfer: one traversal, parameterized by direction.
//!
//! The walk visits each directory entry and applies, in order: the default
//! exclusion list, the symlink policy, the depth cap for directories, and
//! the doublestar glob for files. Errors never abort the traversal — each
//! failing entry is recorded and the walk continues; the final status is
//! `completed` iff the error list is empty.

use std::str::FromStr;

use globset::{Glob, GlobBuilder, GlobMatcher, GlobSet, GlobSetBuilder};
use serde::Serialize;
use tracing::info;

use crate::error::{Error, Result};
use crate::ssh::sftp::FileKind;
use crate::transfer::{check_cancel, copy_hashed, CancelFlag, FsEnd};
use crate::util;

/// Names skipped on every transfer (VCS metadata, caches, env files).
pub const DEFAULT_EXCLUSIONS: &[&str] = &[
    ".git",
    ".svn",
    ".hg",
    "node_modules",
    "__pycache__",
    ".DS_Store",
    "*.pyc",
    "*.pyo",
    ".env",
    ".env.local",
];

/// What to do with symlinked entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymlinkPolicy {
    Skip,
    Preserve,
    Follow,
}

impl FromStr for SymlinkPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "skip" => Ok(SymlinkPolicy::Skip),
            "preserve" => Ok(SymlinkPolicy::Preserve),
            "follow" => Ok(SymlinkPolicy::Follow),
            other => Err(Error::InvalidArgument(format!(
                "symlinks must be one of skip|preserve|follow, got `{other}`"
            ))),
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone)]
pub struct DirTransferOptions {
    /// Doublestar glob matched against slash-separated relative paths.
    pub pattern: String,
    pub symlinks: SymlinkPolicy,
    pub max_depth: u32,
    pub preserve_times: bool,
    pub overwrite: bool,
}

impl Default for DirTransferOptions {
    fn default() -> Self {
        Self {
            pattern: "**".to_string(),
            symlinks: SymlinkPolicy::Skip,
            max_depth: 20,
            preserve_times: false,
            overwrite: false,
        }
    }
}

/// A single failed entry.
#[derive(Debug, Clone, Serialize)]
pub struct EntryError {
    pub path: String,
    pub error: String,
}

/// Result payload for `shell_dir_get` / `shell_dir_put`.
#[derive(Debug, Serialize)]
pub struct DirTransferResult {
    pub status: &'static str,
    pub files_transferred: u64,
    pub dirs_created: u64,
    pub total_bytes: u64,
    pub symlinks_handled: u64,
    pub errors: Vec<EntryError>,
    pub duration_ms: u64,
    pub bytes_per_second: u64,
}

struct Walker<'a> {
    src: FsEnd<'a>,
    dst: FsEnd<'a>,
    src_root: String,
    dst_root: String,
    glob: GlobMatcher,
    exclusions: GlobSet,
    opts: DirTransferOptions,
    cancel: CancelFlag,

    files_transferred: u64,
    dirs_created: u64,
    total_bytes: u64,
    symlinks_handled: u64,
    errors: Vec<EntryError>,
}

/// Transfer a directory tree from `src` to `dst`.
pub fn transfer_dir(
    src: FsEnd<'_>,
    src_root: &str,
    dst: FsEnd<'_>,
    dst_root: &str,
    opts: DirTransferOptions,
    cancel: &CancelFlag,
) -> Result<DirTransferResult> {
    let started = util::now_ms();

    let root_info = src.stat(src_root)?;
    if !root_info.is_dir() {
        return Err(Error::PreconditionFailed(format!(
            "source is not a directory: {src_root}"
        )));
    }

    // literal_separator: `*` stays within one path segment; only `**`
    // crosses directories (doublestar semantics).
    let glob = GlobBuilder::new(&opts.pattern)
        .literal_separator(true)
        .build()
        .map_err(|e| Error::InvalidArgument(format!("pattern `{}`: {e}", opts.pattern)))?
        .compile_matcher();
    let exclusions = exclusion_set()?;

    dst.mkdir_all(dst_root, 0o755)?;

    let mut walker = Walker {
        src,
        dst,
        src_root: src_root.trim_end_matches('/').to_string(),
        dst_root: dst_root.trim_end_matches('/').to_string(),
        glob,
        exclusions,
        opts,
        cancel: CancelFlag::clone(cancel),
        files_transferred: 0,
        dirs_created: 0,
        total_bytes: 0,
        symlinks_handled: 0,
        errors: Vec::new(),
    };
    walker.walk("", 0)?;

    let duration_ms = util::now_ms().saturating_sub(started);
    let bytes_per_second = if duration_ms == 0 {
        0
    } else {
        walker.total_bytes * 1000 / duration_ms
    };
    let status = if walker.errors.is_empty() {
        "completed"
    } else {
        "completed_with_errors"
    };
    info!(
        "dir transfer {status}: {} files, {} dirs, {} bytes, {} errors",
        walker.files_transferred,
        walker.dirs_created,
        walker.total_bytes,
        walker.errors.len()
    );

    Ok(DirTransferResult {
        status,
        files_transferred: walker.files_transferred,
        dirs_created: walker.dirs_created,
        total_bytes: walker.total_bytes,
        symlinks_handled: walker.symlinks_handled,
        errors: walker.errors,
        duration_ms,
        bytes_per_second,
    })
}

fn exclusion_set() -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in DEFAULT_EXCLUSIONS {
        builder.add(
            Glob::new(pattern)
                .map_err(|e| Error::Internal(format!("exclusion `{pattern}`: {e}")))?,
        );
    }
    builder
        .build()
        .map_err(|e| Error::Internal(format!("exclusion set: {e}")))
}

impl Walker<'_> {
    fn record(&mut self, path: &str, err: &Error) {
        self.errors.push(EntryError {
            path: path.to_string(),
            error: err.to_string(),
        });
    }

    fn walk(&mut self, rel: &str, depth: u32) -> Result<()> {
        check_cancel(&self.cancel, "directory walk")?;

        let src_dir = util::join_slash(&self.src_root, rel);
        let entries = match self.src.list_dir(&src_dir) {
            Ok(entries) => entries,
            Err(e) => {
                self.record(&src_dir, &e);
                return Ok(());
            }
        };

        for entry in entries {
            check_cancel(&self.cancel, "directory walk")?;

            if self.exclusions.is_match(&entry.name) {
                continue;
            }

            let rel_child = if rel.is_empty() {
                entry.name.clone()
            } else {
                format!("{rel}/{}", entry.name)
            };
            let src_path = util::join_slash(&self.src_root, &rel_child);
            let dst_path = util::join_slash(&self.dst_root, &rel_child);

            let mut kind = entry.info.kind;
            let mut info = entry.info;

            if kind == FileKind::Symlink {
                match self.opts.symlinks {
                    SymlinkPolicy::Skip => continue,
                    SymlinkPolicy::Preserve => {
                        if let Err(e) = self.preserve_symlink(&src_path, &dst_path) {
                            self.record(&src_path, &e);
                        } else {
                            self.symlinks_handled += 1;
                        }
                        continue;
                    }
                    SymlinkPolicy::Follow => match self.src.stat(&src_path) {
                        Ok(resolved) => {
                            kind = resolved.kind;
                            info = resolved;
                        }
                        Err(e) => {
                            self.record(&src_path, &e);
                            continue;
                        }
                    },
                }
            }

            match kind {
                FileKind::Dir => {
                    if depth < self.opts.max_depth {
                        if let Err(e) = self.dst.mkdir_all(&dst_path, 0o755) {
                            self.record(&dst_path, &e);
                            continue;
                        }
                        self.dirs_created += 1;
                        self.walk(&rel_child, depth + 1)?;
                    }
                }
                FileKind::File => {
                    if !self.glob.is_match(&rel_child) {
                        continue;
                    }
                    match self.copy_entry(&src_path, &dst_path, info.perm, info.atime, info.mtime)
                    {
                        Ok(bytes) => {
                            self.files_transferred += 1;
                            self.total_bytes += bytes;
                        }
                        Err(Error::Cancelled(msg)) => return Err(Error::Cancelled(msg)),
                        Err(e) => self.record(&src_path, &e),
                    }
                }
                FileKind::Symlink | FileKind::Other => {
                    // Sockets, devices, fifos: nothing portable to do.
                }
            }
        }
        Ok(())
    }

    fn preserve_symlink(&self, src_path: &str, dst_path: &str) -> Result<()> {
        let target = self.src.read_link(src_path)?;
        if self.dst.exists(dst_path) {
            if !self.opts.overwrite {
                return Err(Error::PreconditionFailed(format!(
                    "destination exists and overwrite is not set: {dst_path}"
                )));
            }
            self.dst.remove(dst_path)?;
        }
        self.dst.symlink(&target, dst_path)
    }

    fn copy_entry(
        &self,
        src_path: &str,
        dst_path: &str,
        perm: u32,
        atime: u64,
        mtime: u64,
    ) -> Result<u64> {
        if self.dst.exists(dst_path) && !self.opts.overwrite {
            return Err(Error::PreconditionFailed(format!(
                "destination exists and overwrite is not set: {dst_path}"
            )));
        }
        let reader = self.src.open_read(src_path)?;
        let mode = if perm == 0 { 0o644 } else { perm };
        let writer = self.dst.open_write(dst_path, mode, true)?;
        let (bytes, _checksum) = copy_hashed(
            reader,
            writer,
            &self.cancel,
            (&self.src, src_path),
            (&self.dst, dst_path),
        )?;
        if self.opts.preserve_times && mtime > 0 {
            let _ = self.dst.set_times(dst_path, atime, mtime);
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use super::*;
    use crate::ssh::sftp::fake::FakeSftp;

    fn no_cancel() -> CancelFlag {
        Arc::new(AtomicBool::new(false))
    }

    fn seeded_remote() -> FakeSftp {
        let sftp = FakeSftp::new();
        sftp.add_dir("/src");
        sftp.add_file("/src/a.txt", b"alpha");
        sftp.add_file("/src/b.log", b"beta");
        sftp.add_dir("/src/sub");
        sftp.add_file("/src/sub/c.txt", b"gamma");
        sftp.add_dir("/src/.git");
        sftp.add_file("/src/.git/config", b"secret");
        sftp.add_file("/src/cache.pyc", b"bytecode");
        sftp
    }

    #[test]
    fn get_tree_with_default_exclusions() {
        let dir = tempfile::tempdir().unwrap();
        let sftp = seeded_remote();
        let dst = dir.path().join("out").to_string_lossy().into_owned();

        let result = transfer_dir(
            FsEnd::Remote(&sftp),
            "/src",
            FsEnd::Local,
            &dst,
            DirTransferOptions::default(),
            &no_cancel(),
        )
        .unwrap();

        assert_eq!(result.status, "completed");
        assert_eq!(result.files_transferred, 3);
        assert_eq!(result.total_bytes, 5 + 4 + 5);
        assert_eq!(
            std::fs::read(format!("{dst}/sub/c.txt")).unwrap(),
            b"gamma"
        );
        // Excluded names never arrive.
        assert!(!std::path::Path::new(&format!("{dst}/.git")).exists());
        assert!(!std::path::Path::new(&format!("{dst}/cache.pyc")).exists());
    }

    #[test]
    fn glob_pattern_filters_files() {
        let dir = tempfile::tempdir().unwrap();
        let sftp = seeded_remote();
        let dst = dir.path().join("out").to_string_lossy().into_owned();

        let result = transfer_dir(
            FsEnd::Remote(&sftp),
            "/src",
            FsEnd::Local,
            &dst,
            DirTransferOptions {
                pattern: "**/*.txt".to_string(),
                ..Default::default()
            },
            &no_cancel(),
        )
        .unwrap();

        assert_eq!(result.files_transferred, 2);
        assert!(std::path::Path::new(&format!("{dst}/a.txt")).exists());
        assert!(std::path::Path::new(&format!("{dst}/sub/c.txt")).exists());
        assert!(!std::path::Path::new(&format!("{dst}/b.log")).exists());
    }

    #[test]
    fn put_tree_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("tree");
        std::fs::create_dir_all(src.join("nested")).unwrap();
        std::fs::write(src.join("f1"), b"one").unwrap();
        std::fs::write(src.join("nested/f2"), b"two").unwrap();

        let sftp = FakeSftp::new();
        let result = transfer_dir(
            FsEnd::Local,
            &src.to_string_lossy(),
            FsEnd::Remote(&sftp),
            "/dst",
            DirTransferOptions::default(),
            &no_cancel(),
        )
        .unwrap();

        assert_eq!(result.status, "completed");
        assert_eq!(result.files_transferred, 2);
        assert_eq!(sftp.file_data("/dst/f1").unwrap(), b"one");
        assert_eq!(sftp.file_data("/dst/nested/f2").unwrap(), b"two");
    }

    #[test]
    fn dir_roundtrip_preserves_contents_and_modes() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("tree");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("script.sh"), b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(src.join("script.sh"), std::fs::Permissions::from_mode(0o755))
            .unwrap();

        let sftp = FakeSftp::new();
        transfer_dir(
            FsEnd::Local,
            &src.to_string_lossy(),
            FsEnd::Remote(&sftp),
            "/mid",
            DirTransferOptions::default(),
            &no_cancel(),
        )
        .unwrap();

        let back = dir.path().join("back");
        transfer_dir(
            FsEnd::Remote(&sftp),
            "/mid",
            FsEnd::Local,
            &back.to_string_lossy(),
            DirTransferOptions::default(),
            &no_cancel(),
        )
        .unwrap();

        let restored = back.join("script.sh");
        assert_eq!(std::fs::read(&restored).unwrap(), b"#!/bin/sh\n");
        let mode = std::fs::metadata(&restored).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);
    }

    #[test]
    fn symlink_skip_policy() {
        let dir = tempfile::tempdir().unwrap();
        let sftp = FakeSftp::new();
        sftp.add_dir("/src");
        sftp.add_file("/src/real.txt", b"data");
        sftp.add_symlink("/src/link.txt", "/src/real.txt");

        let dst = dir.path().join("out").to_string_lossy().into_owned();
        let result = transfer_dir(
            FsEnd::Remote(&sftp),
            "/src",
            FsEnd::Local,
            &dst,
            DirTransferOptions::default(),
            &no_cancel(),
        )
        .unwrap();

        assert_eq!(result.files_transferred, 1);
        assert_eq!(result.symlinks_handled, 0);
        assert!(!std::path::Path::new(&format!("{dst}/link.txt")).exists());
    }

    #[test]
    fn symlink_preserve_policy() {
        let dir = tempfile::tempdir().unwrap();
        let sftp = FakeSftp::new();
        sftp.add_dir("/src");
        sftp.add_file("/src/real.txt", b"data");
        sftp.add_symlink("/src/link.txt", "real.txt");

        let dst = dir.path().join("out").to_string_lossy().into_owned();
        let result = transfer_dir(
            FsEnd::Remote(&sftp),
            "/src",
            FsEnd::Local,
            &dst,
            DirTransferOptions {
                symlinks: SymlinkPolicy::Preserve,
                ..Default::default()
            },
            &no_cancel(),
        )
        .unwrap();

        assert_eq!(result.symlinks_handled, 1);
        let link = std::fs::read_link(format!("{dst}/link.txt")).unwrap();
        assert_eq!(link.to_string_lossy(), "real.txt");
    }

    #[test]
    fn symlink_follow_policy_copies_target() {
        let dir = tempfile::tempdir().unwrap();
        let sftp = FakeSftp::new();
        sftp.add_dir("/src");
        sftp.add_file("/src/real.txt", b"data");
        sftp.add_symlink("/src/link.txt", "/src/real.txt");

        let dst = dir.path().join("out").to_string_lossy().into_owned();
        let result = transfer_dir(
            FsEnd::Remote(&sftp),
            "/src",
            FsEnd::Local,
            &dst,
            DirTransferOptions {
                symlinks: SymlinkPolicy::Follow,
                ..Default::default()
            },
            &no_cancel(),
        )
        .unwrap();

        assert_eq!(result.files_transferred, 2);
        assert_eq!(
            std::fs::read(format!("{dst}/link.txt")).unwrap(),
            b"data"
        );
    }

    #[test]
    fn max_depth_caps_recursion() {
        let dir = tempfile::tempdir().unwrap();
        let sftp = FakeSftp::new();
        sftp.add_dir("/src");
        sftp.add_dir("/src/d1");
        sftp.add_dir("/src/d1/d2");
        sftp.add_file("/src/d1/shallow.txt", b"s");
        sftp.add_file("/src/d1/d2/deep.txt", b"d");

        let dst = dir.path().join("out").to_string_lossy().into_owned();
        let result = transfer_dir(
            FsEnd::Remote(&sftp),
            "/src",
            FsEnd::Local,
            &dst,
            DirTransferOptions {
                max_depth: 1,
                ..Default::default()
            },
            &no_cancel(),
        )
        .unwrap();

        assert_eq!(result.files_transferred, 1);
        assert!(std::path::Path::new(&format!("{dst}/d1/shallow.txt")).exists());
        assert!(!std::path::Path::new(&format!("{dst}/d1/d2/deep.txt")).exists());
    }

    #[test]
    fn per_entry_errors_do_not_abort() {
        let dir = tempfile::tempdir().unwrap();
        let sftp = seeded_remote();
        let dst = dir.path().join("out").to_string_lossy().into_owned();

        // Pre-create a conflicting destination file with overwrite unset.
        std::fs::create_dir_all(&dst).unwrap();
        std::fs::write(format!("{dst}/a.txt"), b"old").unwrap();

        let result = transfer_dir(
            FsEnd::Remote(&sftp),
            "/src",
            FsEnd::Local,
            &dst,
            DirTransferOptions::default(),
            &no_cancel(),
        )
        .unwrap();

        assert_eq!(result.status, "completed_with_errors");
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].path.ends_with("a.txt"));
        // The rest still transferred.
        assert_eq!(result.files_transferred, 2);
        assert_eq!(std::fs::read(format!("{dst}/a.txt")).unwrap(), b"old");
    }

    #[test]
    fn source_must_be_directory() {
        let sftp = FakeSftp::new();
        sftp.add_file("/src", b"not a dir");
        let err = transfer_dir(
            FsEnd::Remote(&sftp),
            "/src",
            FsEnd::Local,
            "/tmp/never",
            DirTransferOptions::default(),
            &no_cancel(),
        )
        .unwrap_err();
        assert_eq!(err.code(), "precondition_failed");
    }

    #[test]
    fn symlink_policy_parses() {
        assert_eq!(
            "preserve".parse::<SymlinkPolicy>().unwrap(),
            SymlinkPolicy::Preserve
        );
        assert!("sometimes".parse::<SymlinkPolicy>().is_err());
    }
}
