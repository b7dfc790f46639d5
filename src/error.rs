//! Error taxonomy shared by every tool and engine.
//!
//! Each variant carries a human-readable message naming the offending
//! argument or path, and maps to a stable snake_case code via [`Error::code`].
//! Tool handlers serialize `{error, code}` into the tool-result envelope with
//! `isError: true` — the transport itself never throws. Messages never
//! include passwords or other secrets.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing/empty required field, mutually exclusive options, heredoc
    /// detected, invalid enum string.
    #[error("{0}")]
    InvalidArgument(String),

    /// Unknown session id, server name, manifest or file.
    #[error("{0}")]
    NotFound(String),

    /// Operation requires state the target doesn't have (non-SSH session for
    /// an SSH-only tool, destination exists without overwrite, …).
    #[error("{0}")]
    PreconditionFailed(String),

    /// SSH auth rejected, rate-limit lockout, or no sudo password available.
    #[error("{0}")]
    AuthFailed(String),

    /// SFTP/SSH channel errors during transfer.
    #[error("remote I/O: {0}")]
    RemoteIo(String),

    /// Local filesystem errors.
    #[error("local I/O: {0}")]
    LocalIo(String),

    /// Computed SHA-256 disagrees with the expected checksum.
    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),

    /// Command deadline hit without completion.
    #[error("{0}")]
    Timeout(String),

    /// Caller cancelled the operation.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable code for the tool-result payload.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidArgument(_) => "invalid_argument",
            Error::NotFound(_) => "not_found",
            Error::PreconditionFailed(_) => "precondition_failed",
            Error::AuthFailed(_) => "auth_failed",
            Error::RemoteIo(_) => "remote_io",
            Error::LocalIo(_) => "local_io",
            Error::ChecksumMismatch(_) => "checksum_mismatch",
            Error::Timeout(_) => "timeout",
            Error::Cancelled(_) => "cancelled",
            Error::Internal(_) => "internal",
        }
    }

    /// Wrap a local filesystem error with the path that caused it.
    pub fn local(path: &str, err: &std::io::Error) -> Self {
        Error::LocalIo(format!("{path}: {err}"))
    }

    /// Wrap a remote (SFTP/SSH) error with the path that caused it.
    pub fn remote(path: &str, msg: impl std::fmt::Display) -> Self {
        Error::RemoteIo(format!("{path}: {msg}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::InvalidArgument(String::new()).code(), "invalid_argument");
        assert_eq!(Error::AuthFailed(String::new()).code(), "auth_failed");
        assert_eq!(Error::Timeout(String::new()).code(), "timeout");
    }

    #[test]
    fn local_wraps_path() {
        let e = Error::local(
            "/tmp/x",
            &std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(e.to_string().contains("/tmp/x"));
    }
}
