//! Session lifecycle management.
//!
//! [`SessionManager`] is the single authority for creating, looking up, and
//! destroying shell sessions. The map lock is short-held: SSH dialing and
//! session initialization happen outside it, with the session-count limit
//! re-checked at insert time, so no session operation ever blocks another
//! session's I/O.

pub mod exec;
pub mod prompt;
pub mod recording;
#[allow(clippy::module_inception)]
pub mod session;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{RecordingConfig, ServerEntry};
use crate::error::{Error, Result};
use crate::security::{AuthRateLimiter, SudoCache};
use crate::session::exec::Executor;
use crate::session::recording::Recorder;
use crate::session::session::{Backend, Session, SessionMode, SessionSummary};
use crate::shell::pty;
use crate::ssh;
use crate::ssh::sftp::Ssh2Sftp;
use crate::ssh::tunnel::TunnelManager;
use crate::util;

/// Terminal size for every session PTY.
const PTY_ROWS: u16 = 24;
const PTY_COLS: u16 = 80;

/// Output channel depth: bounded so an unread flood of background output
/// applies backpressure to the PTY instead of growing without limit.
const OUTPUT_CHANNEL_DEPTH: usize = 256;
const INPUT_CHANNEL_DEPTH: usize = 64;

/// Arguments for creating an SSH session.
pub struct SshSessionRequest {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Explicit key path; overrides any configured server auth.
    pub key_path: Option<String>,
    /// Matching config entry, when one exists for (host, user).
    pub server: Option<ServerEntry>,
}

/// Manages the pool of active shell sessions. Cloneable — clones share the
/// same map.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    max_sessions: usize,
    recording: RecordingConfig,
}

impl SessionManager {
    pub fn new(max_sessions: usize, recording: RecordingConfig) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            max_sessions,
            recording,
        }
    }

    async fn check_capacity(&self) -> Result<()> {
        let sessions = self.sessions.read().await;
        if sessions.len() >= self.max_sessions {
            return Err(Error::PreconditionFailed(format!(
                "session limit reached (max {})",
                self.max_sessions
            )));
        }
        Ok(())
    }

    async fn insert(&self, session: Arc<Session>) -> Result<Arc<Session>> {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.max_sessions {
            drop(sessions);
            session.close().await;
            return Err(Error::PreconditionFailed(format!(
                "session limit reached (max {})",
                self.max_sessions
            )));
        }
        sessions.insert(session.id.clone(), Arc::clone(&session));
        info!("session {} created, total: {}", session.id, sessions.len());
        Ok(session)
    }

    async fn recorder_for(&self, session_id: &str) -> Option<mpsc::Sender<Vec<u8>>> {
        if !self.recording.enabled {
            return None;
        }
        let dir = util::expand_tilde(&self.recording.path);
        match Recorder::create(Path::new(&dir), session_id).await {
            Ok(recorder) => Some(recorder.sender()),
            Err(e) => {
                warn!("recording disabled for session {session_id}: {e}");
                None
            }
        }
    }

    /// Create a local session: login shell under an 80×24 PTY.
    pub async fn create_local(&self) -> Result<Arc<Session>> {
        self.check_capacity().await?;

        let session_id = Uuid::new_v4().to_string();
        let record_tx = self.recorder_for(&session_id).await;

        let pair = pty::allocate_pty(PTY_ROWS, PTY_COLS)
            .map_err(|e| Error::Internal(format!("allocate pty: {e}")))?;
        let shell = pty::login_shell();
        let cwd = std::env::current_dir()
            .map(|d| d.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "/".to_string());

        let child = pty::spawn_shell_pty(&pair, &shell, &cwd, None)
            .map_err(|e| Error::Internal(format!("spawn shell {shell}: {e}")))?;
        let pid = child.id().unwrap_or(0);

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_DEPTH);
        let (input_tx, input_rx) = mpsc::channel(INPUT_CHANNEL_DEPTH);

        let mut tasks = pty::wire_master(&pair.master, output_tx, input_rx, record_tx)
            .map_err(|e| Error::Internal(format!("wire pty master: {e}")))?;

        // Reap the shell when it exits; the master read loop observes EOF.
        tasks.push(tokio::spawn(async move {
            let mut child = child;
            match child.wait().await {
                Ok(status) => info!("local shell (pid {pid}) exited: {status}"),
                Err(e) => warn!("local shell (pid {pid}) wait error: {e}"),
            }
        }));
        // Keep the master fd alive for the session lifetime.
        let master = pair.master;
        tasks.push(tokio::spawn(async move {
            let _master = master;
            std::future::pending::<()>().await;
        }));

        let executor = Executor::new(output_rx, input_tx.clone());
        let user = std::env::var("USER").unwrap_or_default();

        let session = Arc::new(Session::new(
            session_id,
            SessionMode::Local,
            String::new(),
            user,
            0,
            String::new(),
            executor,
            input_tx,
            Arc::new(AtomicBool::new(false)),
            None,
            None,
            Backend::Local { pid, tasks },
        ));

        if let Err(e) = session.initialize().await {
            session.close().await;
            return Err(e);
        }
        self.insert(session).await
    }

    /// Create an SSH session: rate-limit check, dial + auth, shell channel
    /// with PTY, persistent SFTP channel, then the shared initialization.
    pub async fn create_ssh(
        &self,
        request: SshSessionRequest,
        limiter: &AuthRateLimiter,
    ) -> Result<Arc<Session>> {
        self.check_capacity().await?;
        limiter.check(&request.host, &request.user)?;

        let session_id = Uuid::new_v4().to_string();
        let record_tx = self.recorder_for(&session_id).await;
        let cancel = Arc::new(AtomicBool::new(false));

        let auth = if let Some(ref key_path) = request.key_path {
            ssh::AuthMethod::KeyFile(util::expand_tilde(key_path))
        } else if let Some(ref server) = request.server {
            ssh::AuthMethod::from_server(server)?
        } else {
            ssh::AuthMethod::Agent
        };
        let auth_kind = auth.kind().to_string();

        let host = request.host.clone();
        let port = request.port;
        let user = request.user.clone();

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_DEPTH);
        let (input_tx, input_rx) = mpsc::channel(INPUT_CHANNEL_DEPTH);

        // Dial, open the shell channel, and open SFTP on a blocking thread.
        let dial_cancel = Arc::clone(&cancel);
        let dial_result = tokio::task::spawn_blocking(move || {
            let session = ssh::dial(&host, port, &user, &auth)?;
            let sftp = session
                .sftp()
                .map_err(|e| Error::RemoteIo(format!("open sftp channel: {e}")))?;
            let channel = ssh::open_shell(&session, PTY_ROWS, PTY_COLS)?;
            let io_thread =
                ssh::spawn_io_thread(channel, output_tx, input_rx, record_tx, dial_cancel);
            Ok::<_, Error>((session, sftp, io_thread))
        })
        .await
        .map_err(|e| Error::Internal(format!("ssh dial task: {e}")))?;

        let (ssh_session, sftp, io_thread) = match dial_result {
            Ok(v) => {
                limiter.record_success(&request.host, &request.user);
                v
            }
            Err(e) => {
                if matches!(e, Error::AuthFailed(_)) {
                    limiter.record_failure(&request.host, &request.user);
                }
                return Err(e);
            }
        };

        let ssh_session = Arc::new(ssh_session);
        let sftp_ops = Arc::new(Ssh2Sftp::new(sftp, Arc::clone(&cancel)));
        let tunnels = TunnelManager::new(Arc::clone(&ssh_session), Arc::clone(&cancel));

        let executor = Executor::new(output_rx, input_tx.clone());
        let session = Arc::new(Session::new(
            session_id,
            SessionMode::Ssh,
            request.host,
            request.user,
            request.port,
            auth_kind,
            executor,
            input_tx,
            cancel,
            Some(sftp_ops),
            Some(tunnels),
            Backend::Ssh {
                io_thread: std::sync::Mutex::new(Some(io_thread)),
            },
        ));

        if let Err(e) = session.initialize().await {
            session.close().await;
            return Err(e);
        }
        self.insert(session).await
    }

    /// Look up a session by id.
    pub async fn get(&self, session_id: &str) -> Result<Arc<Session>> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .map(Arc::clone)
            .ok_or_else(|| Error::NotFound(format!("session {session_id} not found")))
    }

    /// Close and remove a session, wiping its sudo cache entry.
    pub async fn close(&self, session_id: &str, sudo_cache: &SudoCache) -> Result<()> {
        let session = {
            let mut sessions = self.sessions.write().await;
            sessions
                .remove(session_id)
                .ok_or_else(|| Error::NotFound(format!("session {session_id} not found")))?
        };
        sudo_cache.purge(&session.host, &session.user);
        session.close().await;
        Ok(())
    }

    /// List summaries of all sessions.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        let mut items: Vec<SessionSummary> =
            sessions.values().map(|s| s.summary()).collect();
        items.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms));
        items
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Close every session (shutdown).
    pub async fn close_all(&self, sudo_cache: &SudoCache) {
        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, s)| s).collect()
        };
        let count = drained.len();
        for session in drained {
            sudo_cache.purge(&session.host, &session.user);
            session.close().await;
        }
        if count > 0 {
            info!("shut down {count} session(s)");
        }
    }
}
