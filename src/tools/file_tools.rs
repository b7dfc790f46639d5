//! Handlers for whole-file, recursive, and chunked transfer tools.
//!
//! The engines are blocking; every handler resolves the session's
//! capability, then runs the engine on a blocking thread with the session's
//! cancel flag.

use std::sync::Arc;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::server::Server;
use crate::session::session::Session;
use crate::ssh::sftp::SftpOps;
use crate::tools::args::{
    self, ChunkedArgs, DirTransferArgs, FileGetArgs, FileMvArgs, FilePutArgs,
    TransferResumeArgs, TransferStatusArgs,
};
use crate::transfer::file::{FileOpResult, FileTransferOptions};
use crate::transfer::recursive::{DirTransferOptions, SymlinkPolicy};
use crate::transfer::{chunked, file, recursive, CancelFlag, FsEnd};
use crate::util;

/// The session's filesystem side: its SFTP capability for SSH sessions, the
/// local filesystem for local sessions.
fn session_fs(session: &Session) -> Option<Arc<dyn SftpOps>> {
    if session.is_ssh() {
        session.require_sftp().ok()
    } else {
        None
    }
}

fn to_json<T: serde::Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| Error::Internal(format!("serialize result: {e}")))
}

async fn run_blocking<T: Send + 'static>(
    task: impl FnOnce() -> Result<T> + Send + 'static,
) -> Result<T> {
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| Error::Internal(format!("transfer task: {e}")))?
}

fn file_options(
    overwrite: bool,
    preserve_times: bool,
    compress: bool,
    expected_checksum: Option<String>,
) -> FileTransferOptions {
    FileTransferOptions {
        overwrite,
        preserve_times,
        compress,
        expected_checksum,
    }
}

pub async fn file_get(arguments: &Value, server: &Arc<Server>) -> Result<Value> {
    let a: FileGetArgs = args::parse(arguments)?;
    let session = server.sessions.get(&a.session_id).await?;
    let sftp = session_fs(&session);
    let cancel = CancelFlag::clone(&session.cancel);
    let opts = file_options(a.overwrite, a.preserve_times, a.compress, a.expected_checksum);
    let local_path = util::expand_tilde(&a.local_path);

    let result: FileOpResult = run_blocking(move || {
        let src = match sftp {
            Some(ref s) => FsEnd::Remote(s.as_ref()),
            None => FsEnd::Local,
        };
        file::copy_file(&src, &a.remote_path, &FsEnd::Local, &local_path, &opts, &cancel)
    })
    .await?;
    to_json(result)
}

pub async fn file_put(arguments: &Value, server: &Arc<Server>) -> Result<Value> {
    let a: FilePutArgs = args::parse(arguments)?;
    let session = server.sessions.get(&a.session_id).await?;
    let sftp = session_fs(&session);
    let cancel = CancelFlag::clone(&session.cancel);
    let opts = file_options(a.overwrite, a.preserve_times, a.compress, a.expected_checksum);
    let local_path = util::expand_tilde(&a.local_path);

    let result: FileOpResult = run_blocking(move || {
        let dst = match sftp {
            Some(ref s) => FsEnd::Remote(s.as_ref()),
            None => FsEnd::Local,
        };
        file::copy_file(&FsEnd::Local, &local_path, &dst, &a.remote_path, &opts, &cancel)
    })
    .await?;
    to_json(result)
}

pub async fn file_mv(arguments: &Value, server: &Arc<Server>) -> Result<Value> {
    let a: FileMvArgs = args::parse(arguments)?;
    let session = server.sessions.get(&a.session_id).await?;
    let sftp = session_fs(&session);

    let result: FileOpResult = run_blocking(move || {
        let end = match sftp {
            Some(ref s) => FsEnd::Remote(s.as_ref()),
            None => FsEnd::Local,
        };
        file::move_file(&end, &a.source_path, &a.destination_path, a.overwrite)
    })
    .await?;
    to_json(result)
}

fn dir_options(a: &DirTransferArgs) -> Result<DirTransferOptions> {
    Ok(DirTransferOptions {
        pattern: a.pattern.clone(),
        symlinks: a.symlinks.parse::<SymlinkPolicy>()?,
        max_depth: a.max_depth,
        preserve_times: a.preserve,
        overwrite: a.overwrite,
    })
}

pub async fn dir_get(arguments: &Value, server: &Arc<Server>) -> Result<Value> {
    let a: DirTransferArgs = args::parse(arguments)?;
    let opts = dir_options(&a)?;
    let session = server.sessions.get(&a.session_id).await?;
    let sftp = session_fs(&session);
    let cancel = CancelFlag::clone(&session.cancel);
    let local_path = util::expand_tilde(&a.local_path);

    let result = run_blocking(move || {
        let src = match sftp {
            Some(ref s) => FsEnd::Remote(s.as_ref()),
            None => FsEnd::Local,
        };
        recursive::transfer_dir(src, &a.remote_path, FsEnd::Local, &local_path, opts, &cancel)
    })
    .await?;
    to_json(result)
}

pub async fn dir_put(arguments: &Value, server: &Arc<Server>) -> Result<Value> {
    let a: DirTransferArgs = args::parse(arguments)?;
    let opts = dir_options(&a)?;
    let session = server.sessions.get(&a.session_id).await?;
    let sftp = session_fs(&session);
    let cancel = CancelFlag::clone(&session.cancel);
    let local_path = util::expand_tilde(&a.local_path);

    let result = run_blocking(move || {
        let dst = match sftp {
            Some(ref s) => FsEnd::Remote(s.as_ref()),
            None => FsEnd::Local,
        };
        recursive::transfer_dir(FsEnd::Local, &local_path, dst, &a.remote_path, opts, &cancel)
    })
    .await?;
    to_json(result)
}

pub async fn file_get_chunked(arguments: &Value, server: &Arc<Server>) -> Result<Value> {
    let a: ChunkedArgs = args::parse(arguments)?;
    let session = server.sessions.get(&a.session_id).await?;
    // Chunked transfers are SSH-only; a local copy is simpler and always
    // correct for local sessions.
    let sftp = session.require_sftp()?;
    let cancel = CancelFlag::clone(&session.cancel);
    let chunk_size = a
        .chunk_size
        .unwrap_or(server.config().limits.default_chunk_size);
    let session_id = session.id.clone();
    let local_path = util::expand_tilde(&a.local_path);

    let result = run_blocking(move || {
        chunked::start_get(
            sftp.as_ref(),
            &a.remote_path,
            &local_path,
            &session_id,
            chunk_size,
            &cancel,
        )
    })
    .await?;
    to_json(result)
}

pub async fn file_put_chunked(arguments: &Value, server: &Arc<Server>) -> Result<Value> {
    let a: ChunkedArgs = args::parse(arguments)?;
    let session = server.sessions.get(&a.session_id).await?;
    let sftp = session.require_sftp()?;
    let cancel = CancelFlag::clone(&session.cancel);
    let chunk_size = a
        .chunk_size
        .unwrap_or(server.config().limits.default_chunk_size);
    let session_id = session.id.clone();
    let local_path = util::expand_tilde(&a.local_path);

    let result = run_blocking(move || {
        chunked::start_put(
            sftp.as_ref(),
            &local_path,
            &a.remote_path,
            &session_id,
            chunk_size,
            &cancel,
        )
    })
    .await?;
    to_json(result)
}

pub async fn transfer_status(arguments: &Value) -> Result<Value> {
    let a: TransferStatusArgs = args::parse(arguments)?;
    let result = run_blocking(move || chunked::status(&a.manifest_path)).await?;
    to_json(result)
}

pub async fn transfer_resume(arguments: &Value, server: &Arc<Server>) -> Result<Value> {
    let a: TransferResumeArgs = args::parse(arguments)?;
    let session = server.sessions.get(&a.session_id).await?;
    let sftp = session.require_sftp()?;
    let cancel = CancelFlag::clone(&session.cancel);

    let result =
        run_blocking(move || chunked::resume(sftp.as_ref(), &a.manifest_path, &cancel)).await?;
    to_json(result)
}
