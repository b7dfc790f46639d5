//! The narrow SFTP capability consumed by the transfer engines.
//!
//! [`SftpOps`] is the seam between the engines and the wire: stat, listing,
//! link handling, rename/remove, directory creation, timestamps, and
//! seekable read/write streams. The production implementation wraps an
//! `ssh2::Sftp` channel on a non-blocking session, retrying `EAGAIN`; tests
//! drive the same engines against an in-memory fake.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::ssh::is_again;

/// What kind of remote object a stat describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Dir,
    Symlink,
    Other,
}

/// Stat result over the capability boundary.
#[derive(Debug, Clone, Copy)]
pub struct FileInfo {
    pub size: u64,
    pub kind: FileKind,
    /// Permission bits (no file-type bits).
    pub perm: u32,
    pub mtime: u64,
    pub atime: u64,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Dir
    }
    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }
    pub fn is_symlink(&self) -> bool {
        self.kind == FileKind::Symlink
    }
}

/// One directory entry (name only, not a full path).
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub info: FileInfo,
}

/// A seekable remote file stream.
pub trait RemoteFile: Read + Write + Seek + Send {}
impl<T: Read + Write + Seek + Send> RemoteFile for T {}

impl std::fmt::Debug for dyn SftpOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn SftpOps").finish_non_exhaustive()
    }
}

/// The narrow remote-filesystem capability.
pub trait SftpOps: Send + Sync {
    /// Stat, following symlinks.
    fn stat(&self, path: &str) -> Result<FileInfo>;
    /// Stat without following symlinks.
    fn lstat(&self, path: &str) -> Result<FileInfo>;
    fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>>;
    fn read_link(&self, path: &str) -> Result<String>;
    fn symlink(&self, target: &str, link: &str) -> Result<()>;
    fn rename(&self, from: &str, to: &str) -> Result<()>;
    fn remove(&self, path: &str) -> Result<()>;
    /// Create a directory and any missing parents.
    fn mkdir_all(&self, path: &str, mode: u32) -> Result<()>;
    /// Set access and modification times (seconds since epoch).
    fn chtimes(&self, path: &str, atime: u64, mtime: u64) -> Result<()>;
    /// Open a file for reading.
    fn open_read(&self, path: &str) -> Result<Box<dyn RemoteFile>>;
    /// Open (create) a file for writing. `truncate` resets existing content.
    fn open_write(&self, path: &str, mode: u32, truncate: bool) -> Result<Box<dyn RemoteFile>>;

    /// Whole-file read convenience.
    fn get_file(&self, path: &str) -> Result<Vec<u8>> {
        let mut f = self.open_read(path)?;
        let mut data = Vec::new();
        f.read_to_end(&mut data)
            .map_err(|e| Error::remote(path, e))?;
        Ok(data)
    }

    /// Whole-file write convenience.
    fn put_file(&self, path: &str, data: &[u8], mode: u32) -> Result<()> {
        let mut f = self.open_write(path, mode, true)?;
        f.write_all(data).map_err(|e| Error::remote(path, e))?;
        f.flush().map_err(|e| Error::remote(path, e))?;
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        self.lstat(path).is_ok()
    }
}

// ─── ssh2 implementation ─────────────────────────────────────────────────────

const S_IFMT: u32 = 0o170_000;
const S_IFDIR: u32 = 0o040_000;
const S_IFREG: u32 = 0o100_000;
const S_IFLNK: u32 = 0o120_000;

fn info_from_stat(stat: &ssh2::FileStat) -> FileInfo {
    let perm = stat.perm.unwrap_or(0);
    let kind = match perm & S_IFMT {
        S_IFDIR => FileKind::Dir,
        S_IFLNK => FileKind::Symlink,
        S_IFREG => FileKind::File,
        // Some servers omit type bits; fall back to size presence.
        0 => FileKind::File,
        _ => FileKind::Other,
    };
    FileInfo {
        size: stat.size.unwrap_or(0),
        kind,
        perm: perm & 0o7777,
        mtime: stat.mtime.unwrap_or(0),
        atime: stat.atime.unwrap_or(0),
    }
}

/// SFTP over a non-blocking `ssh2` session. Every call retries `EAGAIN`;
/// libssh2 serializes transport access internally, so the shell I/O thread
/// and SFTP calls interleave safely.
pub struct Ssh2Sftp {
    sftp: ssh2::Sftp,
    cancel: Arc<AtomicBool>,
}

impl Ssh2Sftp {
    pub fn new(sftp: ssh2::Sftp, cancel: Arc<AtomicBool>) -> Self {
        Self { sftp, cancel }
    }

    fn retry<T>(
        &self,
        path: &str,
        mut op: impl FnMut(&ssh2::Sftp) -> std::result::Result<T, ssh2::Error>,
    ) -> Result<T> {
        loop {
            match op(&self.sftp) {
                Err(ref e) if is_again(e) => {
                    if self.cancel.load(Ordering::Relaxed) {
                        return Err(Error::Cancelled(format!("sftp op on {path}")));
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => return Err(Error::remote(path, e)),
                Ok(v) => return Ok(v),
            }
        }
    }
}

impl SftpOps for Ssh2Sftp {
    fn stat(&self, path: &str) -> Result<FileInfo> {
        let stat = self.retry(path, |s| s.stat(Path::new(path)))?;
        Ok(info_from_stat(&stat))
    }

    fn lstat(&self, path: &str) -> Result<FileInfo> {
        let stat = self.retry(path, |s| s.lstat(Path::new(path)))?;
        Ok(info_from_stat(&stat))
    }

    fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let raw = self.retry(path, |s| s.readdir(Path::new(path)))?;
        let mut entries = Vec::with_capacity(raw.len());
        for (entry_path, stat) in raw {
            let Some(name) = entry_path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name == "." || name == ".." {
                continue;
            }
            entries.push(DirEntry {
                name: name.to_string(),
                info: info_from_stat(&stat),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn read_link(&self, path: &str) -> Result<String> {
        let target = self.retry(path, |s| s.readlink(Path::new(path)))?;
        Ok(target.to_string_lossy().into_owned())
    }

    fn symlink(&self, target: &str, link: &str) -> Result<()> {
        self.retry(link, |s| s.symlink(Path::new(target), Path::new(link)))
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.retry(from, |s| {
            s.rename(
                Path::new(from),
                Path::new(to),
                Some(ssh2::RenameFlags::OVERWRITE),
            )
        })
    }

    fn remove(&self, path: &str) -> Result<()> {
        self.retry(path, |s| s.unlink(Path::new(path)))
    }

    fn mkdir_all(&self, path: &str, mode: u32) -> Result<()> {
        let normalized = path.trim_end_matches('/');
        let mut prefix = String::new();
        for component in normalized.split('/') {
            if component.is_empty() {
                prefix.push('/');
                continue;
            }
            if !prefix.is_empty() && !prefix.ends_with('/') {
                prefix.push('/');
            }
            prefix.push_str(component);
            match self.retry(&prefix.clone(), |s| s.stat(Path::new(&prefix))) {
                Ok(stat) => {
                    if !info_from_stat(&stat).is_dir() {
                        return Err(Error::remote(
                            &prefix,
                            "path component exists and is not a directory",
                        ));
                    }
                }
                Err(_) => {
                    let p = prefix.clone();
                    // Racing creators are fine — re-stat on failure.
                    if self
                        .retry(&p, |s| s.mkdir(Path::new(&prefix), i32::try_from(mode).unwrap_or(0o755)))
                        .is_err()
                        && self.retry(&p, |s| s.stat(Path::new(&prefix))).is_err()
                    {
                        return Err(Error::remote(&p, "mkdir failed"));
                    }
                }
            }
        }
        Ok(())
    }

    fn chtimes(&self, path: &str, atime: u64, mtime: u64) -> Result<()> {
        let stat = ssh2::FileStat {
            size: None,
            uid: None,
            gid: None,
            perm: None,
            atime: Some(atime),
            mtime: Some(mtime),
        };
        self.retry(path, |s| s.setstat(Path::new(path), stat.clone()))
    }

    fn open_read(&self, path: &str) -> Result<Box<dyn RemoteFile>> {
        let file = self.retry(path, |s| s.open(Path::new(path)))?;
        Ok(Box::new(RetryFile {
            inner: file,
            cancel: Arc::clone(&self.cancel),
        }))
    }

    fn open_write(&self, path: &str, mode: u32, truncate: bool) -> Result<Box<dyn RemoteFile>> {
        use ssh2::OpenFlags;
        let mut flags = OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::READ;
        if truncate {
            flags |= OpenFlags::TRUNCATE;
        }
        let file = self.retry(path, |s| {
            s.open_mode(
                Path::new(path),
                flags,
                i32::try_from(mode).unwrap_or(0o644),
                ssh2::OpenType::File,
            )
        })?;
        Ok(Box::new(RetryFile {
            inner: file,
            cancel: Arc::clone(&self.cancel),
        }))
    }
}

/// `ssh2::File` wrapper that retries `WouldBlock` on a non-blocking session.
struct RetryFile {
    inner: ssh2::File,
    cancel: Arc<AtomicBool>,
}

impl RetryFile {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

impl Read for RetryFile {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            match self.inner.read(buf) {
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if self.cancelled() {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::Interrupted,
                            "transfer cancelled",
                        ));
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                other => return other,
            }
        }
    }
}

impl Write for RetryFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        loop {
            match self.inner.write(buf) {
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if self.cancelled() {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::Interrupted,
                            "transfer cancelled",
                        ));
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                other => return other,
            }
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        loop {
            match self.inner.flush() {
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                other => return other,
            }
        }
    }
}

impl Seek for RetryFile {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        // SFTP seek is client-side offset bookkeeping — no round-trip.
        self.inner.seek(pos)
    }
}

// ─── in-memory fake for engine tests ─────────────────────────────────────────

#[cfg(test)]
pub mod fake {
    use std::collections::BTreeMap;
    use std::io::Cursor;
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone)]
    pub enum Node {
        File {
            data: Vec<u8>,
            perm: u32,
            mtime: u64,
            atime: u64,
        },
        Dir,
        Symlink {
            target: String,
        },
    }

    /// In-memory SFTP backend. Paths are stored verbatim (slash-separated).
    #[derive(Default)]
    pub struct FakeSftp {
        pub nodes: Arc<Mutex<BTreeMap<String, Node>>>,
        /// When set, read/write streams fail after this many bytes — used to
        /// simulate a network drop mid-transfer.
        pub fail_after: Mutex<Option<u64>>,
    }

    impl FakeSftp {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_file(&self, path: &str, data: &[u8]) {
            self.add_file_full(path, data, 0o644, 1_700_000_000);
        }

        pub fn add_file_full(&self, path: &str, data: &[u8], perm: u32, mtime: u64) {
            self.nodes.lock().unwrap().insert(
                path.to_string(),
                Node::File {
                    data: data.to_vec(),
                    perm,
                    mtime,
                    atime: mtime,
                },
            );
        }

        pub fn add_dir(&self, path: &str) {
            self.nodes
                .lock()
                .unwrap()
                .insert(path.to_string(), Node::Dir);
        }

        pub fn add_symlink(&self, path: &str, target: &str) {
            self.nodes.lock().unwrap().insert(
                path.to_string(),
                Node::Symlink {
                    target: target.to_string(),
                },
            );
        }

        pub fn file_data(&self, path: &str) -> Option<Vec<u8>> {
            match self.nodes.lock().unwrap().get(path) {
                Some(Node::File { data, .. }) => Some(data.clone()),
                _ => None,
            }
        }

        pub fn set_fail_after(&self, bytes: Option<u64>) {
            *self.fail_after.lock().unwrap() = bytes;
        }

        fn info_for(&self, node: &Node) -> FileInfo {
            match node {
                Node::File {
                    data,
                    perm,
                    mtime,
                    atime,
                } => FileInfo {
                    size: data.len() as u64,
                    kind: FileKind::File,
                    perm: *perm,
                    mtime: *mtime,
                    atime: *atime,
                },
                Node::Dir => FileInfo {
                    size: 0,
                    kind: FileKind::Dir,
                    perm: 0o755,
                    mtime: 0,
                    atime: 0,
                },
                Node::Symlink { .. } => FileInfo {
                    size: 0,
                    kind: FileKind::Symlink,
                    perm: 0o777,
                    mtime: 0,
                    atime: 0,
                },
            }
        }

        fn resolve(&self, path: &str) -> Option<Node> {
            let nodes = self.nodes.lock().unwrap();
            let mut node = nodes.get(path)?.clone();
            // Follow one level of links for stat().
            if let Node::Symlink { ref target } = node {
                node = nodes.get(target)?.clone();
            }
            Some(node)
        }
    }

    /// Write-back stream for the fake: contents land in the node map on drop.
    pub struct FakeFile {
        path: String,
        cursor: Cursor<Vec<u8>>,
        nodes: Arc<Mutex<BTreeMap<String, Node>>>,
        perm: u32,
        writable: bool,
        fail_after: Option<u64>,
        bytes_moved: u64,
    }

    impl FakeFile {
        fn io_budget(&mut self, n: usize) -> std::io::Result<usize> {
            if let Some(limit) = self.fail_after {
                if self.bytes_moved + n as u64 > limit {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        "simulated connection drop",
                    ));
                }
            }
            self.bytes_moved += n as u64;
            Ok(n)
        }
    }

    impl Read for FakeFile {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.cursor.read(buf)?;
            self.io_budget(n)
        }
    }

    impl Write for FakeFile {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let n = self.cursor.write(buf)?;
            self.io_budget(n)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Seek for FakeFile {
        fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
            self.cursor.seek(pos)
        }
    }

    impl Drop for FakeFile {
        fn drop(&mut self) {
            if self.writable {
                let data = self.cursor.get_ref().clone();
                let mut nodes = self.nodes.lock().unwrap();
                let (mtime, atime) = match nodes.get(&self.path) {
                    Some(Node::File { mtime, atime, .. }) => (*mtime, *atime),
                    _ => (0, 0),
                };
                nodes.insert(
                    self.path.clone(),
                    Node::File {
                        data,
                        perm: self.perm,
                        mtime,
                        atime,
                    },
                );
            }
        }
    }

    impl SftpOps for FakeSftp {
        fn stat(&self, path: &str) -> Result<FileInfo> {
            self.resolve(path)
                .map(|n| self.info_for(&n))
                .ok_or_else(|| Error::NotFound(format!("remote path not found: {path}")))
        }

        fn lstat(&self, path: &str) -> Result<FileInfo> {
            let nodes = self.nodes.lock().unwrap();
            nodes
                .get(path)
                .map(|n| self.info_for(n))
                .ok_or_else(|| Error::NotFound(format!("remote path not found: {path}")))
        }

        fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
            let nodes = self.nodes.lock().unwrap();
            if !matches!(nodes.get(path), Some(Node::Dir)) {
                return Err(Error::NotFound(format!("remote dir not found: {path}")));
            }
            let prefix = format!("{}/", path.trim_end_matches('/'));
            let mut out = Vec::new();
            for (p, node) in nodes.iter() {
                if let Some(rest) = p.strip_prefix(&prefix) {
                    if !rest.is_empty() && !rest.contains('/') {
                        out.push(DirEntry {
                            name: rest.to_string(),
                            info: self.info_for(node),
                        });
                    }
                }
            }
            Ok(out)
        }

        fn read_link(&self, path: &str) -> Result<String> {
            match self.nodes.lock().unwrap().get(path) {
                Some(Node::Symlink { target }) => Ok(target.clone()),
                _ => Err(Error::NotFound(format!("not a symlink: {path}"))),
            }
        }

        fn symlink(&self, target: &str, link: &str) -> Result<()> {
            self.add_symlink(link, target);
            Ok(())
        }

        fn rename(&self, from: &str, to: &str) -> Result<()> {
            let mut nodes = self.nodes.lock().unwrap();
            let node = nodes
                .remove(from)
                .ok_or_else(|| Error::NotFound(format!("remote path not found: {from}")))?;
            nodes.insert(to.to_string(), node);
            Ok(())
        }

        fn remove(&self, path: &str) -> Result<()> {
            self.nodes
                .lock()
                .unwrap()
                .remove(path)
                .map(|_| ())
                .ok_or_else(|| Error::NotFound(format!("remote path not found: {path}")))
        }

        fn mkdir_all(&self, path: &str, _mode: u32) -> Result<()> {
            let mut nodes = self.nodes.lock().unwrap();
            let normalized = path.trim_end_matches('/');
            let mut prefix = String::new();
            for component in normalized.split('/') {
                if component.is_empty() {
                    prefix.push('/');
                    continue;
                }
                if !prefix.is_empty() && !prefix.ends_with('/') {
                    prefix.push('/');
                }
                prefix.push_str(component);
                nodes.entry(prefix.clone()).or_insert(Node::Dir);
            }
            Ok(())
        }

        fn chtimes(&self, path: &str, new_atime: u64, new_mtime: u64) -> Result<()> {
            let mut nodes = self.nodes.lock().unwrap();
            match nodes.get_mut(path) {
                Some(Node::File { mtime, atime, .. }) => {
                    *mtime = new_mtime;
                    *atime = new_atime;
                    Ok(())
                }
                Some(_) => Ok(()),
                None => Err(Error::NotFound(format!("remote path not found: {path}"))),
            }
        }

        fn open_read(&self, path: &str) -> Result<Box<dyn RemoteFile>> {
            let nodes = self.nodes.lock().unwrap();
            match nodes.get(path) {
                Some(Node::File { data, perm, .. }) => Ok(Box::new(FakeFile {
                    path: path.to_string(),
                    cursor: Cursor::new(data.clone()),
                    nodes: Arc::clone(&self.nodes),
                    perm: *perm,
                    writable: false,
                    fail_after: *self.fail_after.lock().unwrap(),
                    bytes_moved: 0,
                })),
                _ => Err(Error::NotFound(format!("remote path not found: {path}"))),
            }
        }

        fn open_write(&self, path: &str, mode: u32, truncate: bool) -> Result<Box<dyn RemoteFile>> {
            let nodes = self.nodes.lock().unwrap();
            let existing = match nodes.get(path) {
                Some(Node::File { data, .. }) if !truncate => data.clone(),
                _ => Vec::new(),
            };
            Ok(Box::new(FakeFile {
                path: path.to_string(),
                cursor: Cursor::new(existing),
                nodes: Arc::clone(&self.nodes),
                perm: mode,
                writable: true,
                fail_after: *self.fail_after.lock().unwrap(),
                bytes_moved: 0,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeSftp;
    use super::*;

    #[test]
    fn fake_stat_and_read() {
        let sftp = FakeSftp::new();
        sftp.add_file("/data/a.txt", b"hello");
        let info = sftp.stat("/data/a.txt").unwrap();
        assert!(info.is_file());
        assert_eq!(info.size, 5);
        assert_eq!(sftp.get_file("/data/a.txt").unwrap(), b"hello");
    }

    #[test]
    fn fake_write_persists_on_drop() {
        let sftp = FakeSftp::new();
        sftp.put_file("/out.bin", b"abc", 0o644).unwrap();
        assert_eq!(sftp.file_data("/out.bin").unwrap(), b"abc");
    }

    #[test]
    fn fake_readdir_lists_direct_children() {
        let sftp = FakeSftp::new();
        sftp.add_dir("/root");
        sftp.add_file("/root/a", b"1");
        sftp.add_dir("/root/sub");
        sftp.add_file("/root/sub/deep", b"2");
        let names: Vec<String> = sftp
            .read_dir("/root")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["a".to_string(), "sub".to_string()]);
    }

    #[test]
    fn fake_mkdir_all_creates_parents() {
        let sftp = FakeSftp::new();
        sftp.mkdir_all("/a/b/c", 0o755).unwrap();
        assert!(sftp.lstat("/a").unwrap().is_dir());
        assert!(sftp.lstat("/a/b/c").unwrap().is_dir());
    }

    #[test]
    fn fake_symlink_roundtrip() {
        let sftp = FakeSftp::new();
        sftp.add_file("/real", b"x");
        sftp.symlink("/real", "/link").unwrap();
        assert!(sftp.lstat("/link").unwrap().is_symlink());
        assert!(sftp.stat("/link").unwrap().is_file());
        assert_eq!(sftp.read_link("/link").unwrap(), "/real");
    }
}
