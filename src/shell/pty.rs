//! Local PTY allocation, shell spawning, and channel wiring.
//!
//! Uses the `nix` crate for POSIX PTY APIs. The shell is spawned as a
//! session leader with the PTY slave as its controlling terminal, so job
//! control works and `^C` written to the master reaches the foreground job
//! only. The master fd is dup'd into independent read/write handles that
//! bridge the PTY to the executor's byte channels.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::process::Stdio;

use nix::pty::{openpty, OpenptyResult, Winsize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::debug;

/// An allocated PTY pair (master + slave).
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

/// Allocate a PTY pair sized `rows` × `cols`.
pub fn allocate_pty(rows: u16, cols: u16) -> Result<PtyPair, nix::Error> {
    let size = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    openpty(&size, None).map(|OpenptyResult { master, slave }| PtyPair { master, slave })
}

/// Spawn a login shell attached to the slave side of the PTY.
///
/// Between fork and exec the child calls `setsid`, adopts the slave as its
/// controlling terminal, and points all three stdio fds at it. Job control
/// then works as in a real terminal: `^C` written to the master reaches the
/// foreground job, not the shell.
pub fn spawn_shell_pty(
    pty: &PtyPair,
    shell: &str,
    working_dir: &str,
    env: Option<&HashMap<String, String>>,
) -> std::io::Result<Child> {
    let slave_fd = pty.slave.as_raw_fd();

    let mut cmd = Command::new(shell);
    cmd.arg("-l") // login shell, so rc files are sourced
        .current_dir(working_dir)
        .env("TERM", "xterm-256color")
        // Stdio is taken over inside pre_exec; keep tokio's pipes out of
        // the way.
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    if let Some(vars) = env {
        cmd.envs(vars);
    }

    // SAFETY: only async-signal-safe syscalls run between fork and exec.
    unsafe {
        cmd.pre_exec(move || {
            if libc::setsid() < 0 || libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            for stdio_fd in 0..3 {
                if libc::dup2(slave_fd, stdio_fd) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            if slave_fd > 2 {
                libc::close(slave_fd);
            }
            Ok(())
        });
    }

    cmd.spawn()
}

/// Bridge the PTY master to byte channels: a writer task consuming
/// `input_rx` and a reader task feeding `output_tx` (and, best-effort, the
/// recording tee). Returns the task handles so the session can abort them.
pub fn wire_master(
    master: &OwnedFd,
    output_tx: mpsc::Sender<Vec<u8>>,
    mut input_rx: mpsc::Receiver<Vec<u8>>,
    record_tx: Option<mpsc::Sender<Vec<u8>>>,
) -> std::io::Result<Vec<tokio::task::JoinHandle<()>>> {
    let master_raw: RawFd = master.as_raw_fd();

    let writer_fd: RawFd = unsafe { libc::dup(master_raw) };
    if writer_fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let reader_fd: RawFd = unsafe { libc::dup(master_raw) };
    if reader_fd < 0 {
        unsafe {
            libc::close(writer_fd);
        }
        return Err(std::io::Error::last_os_error());
    }

    // SAFETY: we own these fds via dup.
    let mut master_write =
        tokio::fs::File::from_std(unsafe { std::fs::File::from_raw_fd(writer_fd) });
    let mut master_read =
        tokio::fs::File::from_std(unsafe { std::fs::File::from_raw_fd(reader_fd) });

    let writer_task = tokio::spawn(async move {
        while let Some(data) = input_rx.recv().await {
            if master_write.write_all(&data).await.is_err() {
                break;
            }
            if master_write.flush().await.is_err() {
                break;
            }
        }
    });

    let reader_task = tokio::spawn(async move {
        let mut tmp = [0u8; 4096];
        loop {
            match master_read.read(&mut tmp).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Some(ref tee) = record_tx {
                        let _ = tee.try_send(tmp[..n].to_vec());
                    }
                    if output_tx.send(tmp[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("PTY master read loop ended");
    });

    Ok(vec![writer_task, reader_task])
}

/// The user's login shell, from `$SHELL`, falling back to `/bin/sh`.
pub fn login_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}
