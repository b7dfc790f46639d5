//! SSH connections and the interactive shell channel.
//!
//! One `ssh2::Session` backs each shell session: an interactive channel with
//! a remote PTY plus a persistent SFTP channel on the same transport. After
//! the (blocking) handshake and auth, the session is switched to
//! non-blocking mode; every subsequent operation retries on `EAGAIN`, which
//! lets the shell I/O thread, SFTP calls, and tunnel channels share the
//! transport without starving each other.

pub mod sftp;
pub mod tunnel;

use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::ServerEntry;
use crate::error::{Error, Result};

/// How a connection authenticates.
pub enum AuthMethod {
    /// ssh-agent.
    Agent,
    /// Private key file (optionally passphrase-protected via agent).
    KeyFile(String),
    /// Password taken from a configured environment variable.
    Password(String),
}

impl AuthMethod {
    /// Short label for session metadata; never carries the secret.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthMethod::Agent => "agent",
            AuthMethod::KeyFile(_) => "key",
            AuthMethod::Password(_) => "password",
        }
    }

    /// Resolve the auth method for a configured server. Password values are
    /// read from the named environment variable at call time.
    pub fn from_server(entry: &ServerEntry) -> Result<Self> {
        match entry.auth_type.as_str() {
            "agent" => Ok(AuthMethod::Agent),
            "key" => {
                let path = entry.key_path.as_ref().ok_or_else(|| {
                    Error::InvalidArgument(format!(
                        "server `{}`: auth_type=key requires key_path",
                        entry.name
                    ))
                })?;
                Ok(AuthMethod::KeyFile(crate::util::expand_tilde(path)))
            }
            "password" => {
                let var = entry.password_env.as_ref().ok_or_else(|| {
                    Error::InvalidArgument(format!(
                        "server `{}`: auth_type=password requires password_env",
                        entry.name
                    ))
                })?;
                let password = std::env::var(var).map_err(|_| {
                    Error::AuthFailed(format!(
                        "server `{}`: password env var `{var}` is not set",
                        entry.name
                    ))
                })?;
                Ok(AuthMethod::Password(password))
            }
            other => Err(Error::InvalidArgument(format!(
                "server `{}`: unknown auth_type `{other}`",
                entry.name
            ))),
        }
    }
}

/// Default TCP connect + handshake timeout.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval for non-blocking retries.
const RETRY_SLEEP: Duration = Duration::from_millis(10);

/// True when an ssh2 error is `LIBSSH2_ERROR_EAGAIN` (non-blocking would
/// block — retry).
pub fn is_again(e: &ssh2::Error) -> bool {
    matches!(e.code(), ssh2::ErrorCode::Session(-37))
}

/// Retry an ssh2 operation that may return EAGAIN on a non-blocking session.
pub fn retry_ssh2<T>(
    cancel: &AtomicBool,
    mut op: impl FnMut() -> std::result::Result<T, ssh2::Error>,
) -> std::result::Result<T, ssh2::Error> {
    loop {
        match op() {
            Err(ref e) if is_again(e) => {
                if cancel.load(Ordering::Relaxed) {
                    return Err(ssh2::Error::from_errno(ssh2::ErrorCode::Session(-37)));
                }
                std::thread::sleep(RETRY_SLEEP);
            }
            other => return other,
        }
    }
}

/// Dial and authenticate. Blocking — call from `spawn_blocking`.
///
/// The returned session is still in blocking mode; [`open_shell`] switches
/// it to non-blocking after the channels are established.
pub fn dial(host: &str, port: u16, user: &str, auth: &AuthMethod) -> Result<ssh2::Session> {
    let addr = format!("{host}:{port}");
    let sock_addr = addr
        .to_socket_addrs()
        .map_err(|e| Error::RemoteIo(format!("resolve {addr}: {e}")))?
        .next()
        .ok_or_else(|| Error::RemoteIo(format!("resolve {addr}: no addresses")))?;

    let tcp = TcpStream::connect_timeout(&sock_addr, DIAL_TIMEOUT)
        .map_err(|e| Error::RemoteIo(format!("connect {addr}: {e}")))?;

    let mut session =
        ssh2::Session::new().map_err(|e| Error::Internal(format!("ssh session init: {e}")))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(DIAL_TIMEOUT.as_millis() as u32);
    session
        .handshake()
        .map_err(|e| Error::RemoteIo(format!("ssh handshake with {addr}: {e}")))?;

    match auth {
        AuthMethod::Agent => session
            .userauth_agent(user)
            .map_err(|e| Error::AuthFailed(format!("agent auth for {user}@{host}: {e}")))?,
        AuthMethod::KeyFile(path) => session
            .userauth_pubkey_file(user, None, std::path::Path::new(path), None)
            .map_err(|e| Error::AuthFailed(format!("key auth for {user}@{host}: {e}")))?,
        AuthMethod::Password(password) => session
            .userauth_password(user, password)
            .map_err(|e| Error::AuthFailed(format!("password auth for {user}@{host}: {e}")))?,
    }

    if !session.authenticated() {
        return Err(Error::AuthFailed(format!(
            "auth for {user}@{host} was not accepted"
        )));
    }

    session.set_keepalive(true, 30);
    // Remaining blocking calls (channel/SFTP setup) keep the dial timeout.
    Ok(session)
}

/// Open the interactive shell channel with a remote PTY, then switch the
/// session to non-blocking mode for the I/O loop.
pub fn open_shell(session: &ssh2::Session, rows: u16, cols: u16) -> Result<ssh2::Channel> {
    let mut channel = session
        .channel_session()
        .map_err(|e| Error::RemoteIo(format!("open shell channel: {e}")))?;
    channel
        .request_pty(
            "xterm-256color",
            None,
            Some((u32::from(cols), u32::from(rows), 0, 0)),
        )
        .map_err(|e| Error::RemoteIo(format!("request pty: {e}")))?;
    channel
        .shell()
        .map_err(|e| Error::RemoteIo(format!("start shell: {e}")))?;
    session.set_blocking(false);
    Ok(channel)
}

/// Bridge the shell channel to byte channels on a dedicated OS thread.
///
/// The loop polls the input queue and the channel; when neither makes
/// progress it sleeps briefly. The thread exits on cancel, remote EOF, or a
/// hard channel error, closing the output channel so the executor observes
/// the loss.
pub fn spawn_io_thread(
    mut channel: ssh2::Channel,
    output_tx: mpsc::Sender<Vec<u8>>,
    mut input_rx: mpsc::Receiver<Vec<u8>>,
    record_tx: Option<mpsc::Sender<Vec<u8>>>,
    cancel: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        use std::io::{Read, Write};

        let mut buf = [0u8; 4096];
        loop {
            if cancel.load(Ordering::Relaxed) {
                break;
            }
            let mut progressed = false;

            // Drain queued input.
            while let Ok(data) = input_rx.try_recv() {
                let mut pos = 0;
                while pos < data.len() {
                    if cancel.load(Ordering::Relaxed) {
                        break;
                    }
                    match channel.write(&data[pos..]) {
                        Ok(n) => pos += n,
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            std::thread::sleep(RETRY_SLEEP);
                        }
                        Err(e) => {
                            warn!("ssh channel write failed: {e}");
                            cancel.store(true, Ordering::Relaxed);
                            break;
                        }
                    }
                }
                let _ = channel.flush();
                progressed = true;
            }

            match channel.read(&mut buf) {
                Ok(0) => {
                    debug!("ssh shell channel EOF");
                    break;
                }
                Ok(n) => {
                    if let Some(ref tee) = record_tx {
                        let _ = tee.try_send(buf[..n].to_vec());
                    }
                    if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                    progressed = true;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    warn!("ssh channel read failed: {e}");
                    break;
                }
            }

            if !progressed {
                std::thread::sleep(RETRY_SLEEP);
            }
        }

        let _ = channel.close();
        // output_tx drops here; the executor sees a closed stream.
    })
}

/// Handshake-only connectivity test against a configured server.
/// Dials, authenticates, and disconnects immediately.
pub fn test_server(entry: &ServerEntry) -> Result<()> {
    let auth = AuthMethod::from_server(entry)?;
    let session = dial(&entry.host, entry.port, &entry.user, &auth)?;
    let _ = session.disconnect(None, "connection test", None);
    Ok(())
}
