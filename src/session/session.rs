//! A single interactive shell session over a PTY — local or SSH-backed.
//!
//! Both modes drive the same command executor through byte channels; the
//! difference is capability: SSH sessions additionally carry the SFTP
//! capability and a tunnel manager. Tools that need SFTP test for it and
//! fail with `precondition_failed` on local sessions.
//!
//! ## Command slot
//!
//! Only one of exec / provide_input / send_raw may drive the PTY at a time.
//! The executor sits behind a `tokio::sync::Mutex` (FIFO), so concurrent
//! tool calls serialize in arrival order. `shell_interrupt` does not need
//! the slot to deliver `^C` — it writes through a cloned input sender, so a
//! hung command can always be killed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::security::{CommandFilter, SudoCache};
use crate::session::exec::{self, Executor, RawOutcome};
use crate::session::prompt::PromptType;
use crate::ssh::sftp::SftpOps;
use crate::ssh::tunnel::{TunnelManager, TunnelSpec};
use crate::util;

/// Directory (under the session cwd) for auto-saved stdout overflow.
pub const OVERFLOW_DIR: &str = ".claude-shell-mcp";

/// Session transport mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Local,
    Ssh,
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initializing,
    Idle,
    Running,
    AwaitingInput,
    TimeoutRecovering,
    Closed,
}

/// Execution status in an [`ExecResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    Completed,
    AwaitingInput,
    Timeout,
}

/// Caller-facing result of exec / provide_input / send_raw.
#[derive(Debug, Serialize)]
pub struct ExecResult {
    pub status: ExecStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub stdout: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub async_output: String,
    pub command_id: String,
    pub prompt_type: PromptType,
    pub mask_input: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_lines: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shown_lines: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<usize>,
}

/// Per-call executor options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecOptions {
    /// 0 means "use the configured default".
    pub timeout_ms: u64,
    pub tail_lines: usize,
    pub head_lines: usize,
}

/// Policy snapshot handed to the session by the dispatcher for one call.
pub struct ExecPolicy {
    pub filter: Arc<CommandFilter>,
    /// Env var carrying the sudo password for this session's server, if
    /// configured.
    pub sudo_env: Option<String>,
    pub output_save_threshold: usize,
    pub default_timeout_ms: u64,
}

/// Transport-specific teardown handles.
pub enum Backend {
    Local {
        /// Shell pid (session leader; pgid == pid).
        pid: u32,
        tasks: Vec<tokio::task::JoinHandle<()>>,
    },
    Ssh {
        io_thread: StdMutex<Option<std::thread::JoinHandle<()>>>,
    },
}

/// One interactive shell session.
pub struct Session {
    pub id: String,
    pub mode: SessionMode,
    pub host: String,
    pub user: String,
    pub port: u16,
    pub auth_kind: String,
    pub created_at_ms: u64,
    last_used_ms: AtomicU64,

    state: StdMutex<SessionState>,
    cwd: StdMutex<String>,

    executor: Mutex<Executor>,
    input_tx: mpsc::Sender<Vec<u8>>,
    pub cancel: Arc<AtomicBool>,

    sftp: Option<Arc<dyn SftpOps>>,
    tunnels: Option<TunnelManager>,
    saved_tunnels: StdMutex<Vec<TunnelSpec>>,

    backend: Backend,
}

/// Summary row for `shell_session_list` / `shell_session_status`.
#[derive(Debug, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub mode: SessionMode,
    pub state: SessionState,
    pub cwd: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(skip_serializing_if = "is_zero_port")]
    pub port: u16,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub auth_kind: String,
    pub created_at_ms: u64,
    pub last_used_ms: u64,
    pub tunnels: usize,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero_port(p: &u16) -> bool {
    *p == 0
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        mode: SessionMode,
        host: String,
        user: String,
        port: u16,
        auth_kind: String,
        executor: Executor,
        input_tx: mpsc::Sender<Vec<u8>>,
        cancel: Arc<AtomicBool>,
        sftp: Option<Arc<dyn SftpOps>>,
        tunnels: Option<TunnelManager>,
        backend: Backend,
    ) -> Self {
        let now = util::now_ms();
        Self {
            id,
            mode,
            host,
            user,
            port,
            auth_kind,
            created_at_ms: now,
            last_used_ms: AtomicU64::new(now),
            state: StdMutex::new(SessionState::Initializing),
            cwd: StdMutex::new(String::new()),
            executor: Mutex::new(executor),
            input_tx,
            cancel,
            sftp,
            tunnels,
            saved_tunnels: StdMutex::new(Vec::new()),
            backend,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("session state poisoned")
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        *self.state.lock().expect("session state poisoned") = state;
    }

    pub fn cwd(&self) -> String {
        self.cwd.lock().expect("session cwd poisoned").clone()
    }

    fn set_cwd(&self, cwd: String) {
        *self.cwd.lock().expect("session cwd poisoned") = cwd;
    }

    pub fn last_used_ms(&self) -> u64 {
        self.last_used_ms.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.last_used_ms.store(util::now_ms(), Ordering::Relaxed);
    }

    pub fn is_ssh(&self) -> bool {
        self.mode == SessionMode::Ssh
    }

    /// The SFTP capability, or `precondition_failed` for local sessions.
    pub fn require_sftp(&self) -> Result<Arc<dyn SftpOps>> {
        self.sftp.as_ref().map(Arc::clone).ok_or_else(|| {
            Error::PreconditionFailed(format!(
                "session {} is not an SSH session (no SFTP capability)",
                self.id
            ))
        })
    }

    /// The tunnel manager, or `precondition_failed` for local sessions.
    pub fn require_tunnels(&self) -> Result<&TunnelManager> {
        self.tunnels.as_ref().ok_or_else(|| {
            Error::PreconditionFailed(format!(
                "session {} is not an SSH session (tunnels unavailable)",
                self.id
            ))
        })
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id.clone(),
            mode: self.mode,
            state: self.state(),
            cwd: self.cwd(),
            host: self.host.clone(),
            user: self.user.clone(),
            port: self.port,
            auth_kind: self.auth_kind.clone(),
            created_at_ms: self.created_at_ms,
            last_used_ms: self.last_used_ms(),
            tunnels: self.tunnels.as_ref().map_or(0, |t| t.list().len()),
        }
    }

    /// Remember a tunnel descriptor for `shell_tunnel_restore`.
    pub fn save_tunnel(&self, spec: TunnelSpec) {
        self.saved_tunnels
            .lock()
            .expect("saved tunnels poisoned")
            .push(spec);
    }

    pub fn saved_tunnels(&self) -> Vec<TunnelSpec> {
        self.saved_tunnels
            .lock()
            .expect("saved tunnels poisoned")
            .clone()
    }

    pub fn forget_saved_tunnel(&self, spec: &TunnelSpec) {
        let mut saved = self.saved_tunnels.lock().expect("saved tunnels poisoned");
        saved.retain(|s| {
            !(s.bind_port == spec.bind_port
                && s.target_port == spec.target_port
                && s.target_host == spec.target_host
                && s.kind == spec.kind)
        });
    }

    /// Run the post-spawn initialization: drain the banner/prompt, read the
    /// initial cwd, and move to `idle`.
    pub(crate) async fn initialize(&self) -> Result<()> {
        let mut executor = self.executor.lock().await;
        executor.drain(Duration::from_millis(300)).await;
        // The banner is noise, not async output of anyone's command.
        executor.discard_buffer();
        if let Some(cwd) = executor.read_cwd().await {
            self.set_cwd(cwd);
        } else if self.mode == SessionMode::Local {
            if let Ok(dir) = std::env::current_dir() {
                self.set_cwd(dir.to_string_lossy().into_owned());
            }
        }
        drop(executor);
        self.set_state(SessionState::Idle);
        info!("session {} initialized (cwd: {})", self.id, self.cwd());
        Ok(())
    }

    fn gate_open(&self) -> Result<()> {
        match self.state() {
            SessionState::Closed => Err(Error::NotFound(format!(
                "session {} is closed",
                self.id
            ))),
            SessionState::Initializing => Err(Error::PreconditionFailed(format!(
                "session {} is still initializing",
                self.id
            ))),
            _ => Ok(()),
        }
    }

    fn sudo_resolver<'a>(
        &'a self,
        sudo_cache: &'a SudoCache,
        policy: &'a ExecPolicy,
    ) -> impl Fn() -> Option<String> + 'a {
        move || {
            if let Some(password) = sudo_cache.get(&self.host, &self.user) {
                return Some(password);
            }
            if let Some(ref var) = policy.sudo_env {
                if let Ok(password) = std::env::var(var) {
                    return Some(password);
                }
            }
            None
        }
    }

    /// Execute a command through the PTY state machine.
    pub async fn exec(
        &self,
        command: &str,
        opts: ExecOptions,
        policy: &ExecPolicy,
        sudo_cache: &SudoCache,
    ) -> Result<ExecResult> {
        self.gate_open()?;
        if opts.tail_lines > 0 && opts.head_lines > 0 {
            return Err(Error::InvalidArgument(
                "tail_lines and head_lines are mutually exclusive".to_string(),
            ));
        }
        if exec::contains_heredoc(command) {
            return Err(Error::InvalidArgument(
                "heredocs are not supported in shell_exec; use shell_file_put or printf"
                    .to_string(),
            ));
        }
        if let crate::security::filter::Verdict::Blocked(reason) =
            policy.filter.evaluate(command)
        {
            return Err(Error::InvalidArgument(format!("command {reason}")));
        }
        if self.state() == SessionState::AwaitingInput {
            return Err(Error::PreconditionFailed(format!(
                "session {} is awaiting input; use shell_provide_input or shell_interrupt",
                self.id
            )));
        }

        let timeout = self.effective_timeout(opts.timeout_ms, policy);
        let mut executor = self.executor.lock().await;
        self.set_state(SessionState::Running);
        self.touch();

        let sudo = self.sudo_resolver(sudo_cache, policy);
        let outcome = executor.run_command(command, timeout, &sudo).await;
        self.settle(executor, outcome, opts, policy).await
    }

    /// Provide a line of input to a command paused at `awaiting_input`.
    pub async fn provide_input(
        &self,
        input: &str,
        cache_for_sudo: bool,
        policy: &ExecPolicy,
        sudo_cache: &SudoCache,
    ) -> Result<ExecResult> {
        self.gate_open()?;
        if self.state() != SessionState::AwaitingInput {
            return Err(Error::PreconditionFailed(format!(
                "session {} is not awaiting input",
                self.id
            )));
        }
        if cache_for_sudo {
            sudo_cache.put(&self.host, &self.user, input);
        }

        let timeout = self.effective_timeout(0, policy);
        let mut executor = self.executor.lock().await;
        self.set_state(SessionState::Running);
        self.touch();

        let sudo = self.sudo_resolver(sudo_cache, policy);
        let outcome = executor.provide_input(input, timeout, &sudo).await;
        self.settle(executor, outcome, ExecOptions::default(), policy)
            .await
    }

    /// Send raw bytes (no newline) to a paused command.
    pub async fn send_raw(
        &self,
        input: &str,
        policy: &ExecPolicy,
        sudo_cache: &SudoCache,
    ) -> Result<ExecResult> {
        self.gate_open()?;
        if self.state() != SessionState::AwaitingInput {
            return Err(Error::PreconditionFailed(format!(
                "session {} is not awaiting input",
                self.id
            )));
        }

        let timeout = self.effective_timeout(0, policy);
        let mut executor = self.executor.lock().await;
        self.set_state(SessionState::Running);
        self.touch();

        let sudo = self.sudo_resolver(sudo_cache, policy);
        let outcome = executor.send_raw(input.as_bytes(), timeout, &sudo).await;
        self.settle(executor, outcome, ExecOptions::default(), policy)
            .await
    }

    /// Interrupt the foreground job. `^C` is delivered through a cloned
    /// input sender so it works even while a command holds the slot.
    pub async fn interrupt(&self) -> Result<()> {
        self.gate_open()?;
        self.input_tx
            .send(vec![0x03])
            .await
            .map_err(|_| Error::Internal("session input channel closed".to_string()))?;
        self.touch();

        // If the slot is free (command paused or shell idle), also settle the
        // executor state so leftover buffer doesn't pollute the next command.
        match tokio::time::timeout(Duration::from_millis(200), self.executor.lock()).await {
            Ok(mut executor) => {
                self.set_state(SessionState::TimeoutRecovering);
                executor.interrupt().await?;
                self.set_state(SessionState::Idle);
            }
            Err(_) => {
                debug!(
                    "session {}: interrupt delivered while command in flight",
                    self.id
                );
            }
        }
        Ok(())
    }

    fn effective_timeout(&self, timeout_ms: u64, policy: &ExecPolicy) -> Duration {
        let ms = if timeout_ms == 0 {
            policy.default_timeout_ms
        } else {
            timeout_ms
        };
        Duration::from_millis(ms)
    }

    /// Convert a raw executor outcome into an `ExecResult`, applying state
    /// transitions, cwd reconciliation, and the output policy.
    async fn settle(
        &self,
        mut executor: tokio::sync::MutexGuard<'_, Executor>,
        outcome: Result<RawOutcome>,
        opts: ExecOptions,
        policy: &ExecPolicy,
    ) -> Result<ExecResult> {
        match outcome {
            Err(e) => {
                // Unrecoverable PTY loss closes the session; other errors
                // leave the shell idle.
                if matches!(e, Error::Internal(_)) {
                    self.set_state(SessionState::Closed);
                } else {
                    self.set_state(SessionState::Idle);
                }
                Err(e)
            }
            Ok(RawOutcome::Completed {
                command_id,
                stdout,
                exit_code,
                async_output,
            }) => {
                if let Some(cwd) = executor.read_cwd().await {
                    self.set_cwd(cwd);
                }
                drop(executor);
                self.set_state(SessionState::Idle);
                self.finish_completed(command_id, stdout, exit_code, async_output, opts, policy)
                    .await
            }
            Ok(RawOutcome::AwaitingInput { command_id, prompt }) => {
                drop(executor);
                self.set_state(SessionState::AwaitingInput);
                Ok(ExecResult {
                    status: ExecStatus::AwaitingInput,
                    exit_code: None,
                    stdout: String::new(),
                    async_output: String::new(),
                    command_id,
                    prompt_type: prompt,
                    mask_input: prompt == PromptType::Password,
                    truncated: None,
                    total_lines: None,
                    shown_lines: None,
                    output_file: None,
                    total_bytes: None,
                })
            }
            Ok(RawOutcome::TimedOut {
                command_id,
                async_output,
            }) => {
                drop(executor);
                self.set_state(SessionState::Idle);
                Ok(ExecResult {
                    status: ExecStatus::Timeout,
                    exit_code: None,
                    stdout: String::new(),
                    async_output,
                    command_id,
                    prompt_type: PromptType::None,
                    mask_input: false,
                    truncated: None,
                    total_lines: None,
                    shown_lines: None,
                    output_file: None,
                    total_bytes: None,
                })
            }
        }
    }

    async fn finish_completed(
        &self,
        command_id: String,
        stdout: String,
        exit_code: i32,
        async_output: String,
        opts: ExecOptions,
        policy: &ExecPolicy,
    ) -> Result<ExecResult> {
        let mut result = ExecResult {
            status: ExecStatus::Completed,
            exit_code: Some(exit_code),
            stdout,
            async_output,
            command_id,
            prompt_type: PromptType::None,
            mask_input: false,
            truncated: None,
            total_lines: None,
            shown_lines: None,
            output_file: None,
            total_bytes: None,
        };

        let full_payload = result.stdout.clone();
        if opts.tail_lines > 0 || opts.head_lines > 0 {
            if let Some((sliced, total, shown)) =
                exec::slice_lines(&result.stdout, opts.tail_lines, opts.head_lines)
            {
                result.stdout = sliced;
                result.truncated = Some(true);
                result.total_lines = Some(total);
                result.shown_lines = Some(shown);
            }
        }

        if result.stdout.len() > policy.output_save_threshold {
            match self.save_overflow(&full_payload).await {
                Ok(path) => {
                    result.total_bytes = Some(full_payload.len());
                    result.output_file = Some(path);
                    result.stdout = String::new();
                }
                Err(e) => {
                    warn!("session {}: overflow save failed: {e}", self.id);
                }
            }
        }

        Ok(result)
    }

    /// Write oversized stdout to `<cwd>/.claude-shell-mcp/<session>-<ns>.out`
    /// on the side the cwd lives on (remote for SSH sessions).
    async fn save_overflow(&self, payload: &str) -> Result<String> {
        let dir = util::join_slash(&self.cwd(), OVERFLOW_DIR);
        let path = format!("{dir}/{}-{}.out", self.id, util::now_ns());

        if let Some(ref sftp) = self.sftp {
            let sftp = Arc::clone(sftp);
            let dir = dir.clone();
            let path_clone = path.clone();
            let data = payload.as_bytes().to_vec();
            tokio::task::spawn_blocking(move || {
                sftp.mkdir_all(&dir, 0o755)?;
                sftp.put_file(&path_clone, &data, 0o644)
            })
            .await
            .map_err(|e| Error::Internal(format!("overflow save task: {e}")))??;
        } else {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| Error::local(&dir, &e))?;
            tokio::fs::write(&path, payload)
                .await
                .map_err(|e| Error::local(&path, &e))?;
        }
        Ok(path)
    }

    /// Tear the session down: cancel I/O, kill the shell, close tunnels.
    pub(crate) async fn close(&self) {
        self.set_state(SessionState::Closed);
        self.cancel.store(true, Ordering::Relaxed);

        if let Some(ref tunnels) = self.tunnels {
            tunnels.close_all();
        }

        match &self.backend {
            Backend::Local { pid, tasks } => {
                let pgid = i64::from(*pid);
                if pgid > 0 {
                    // The shell is a session leader (setsid), so pgid == pid.
                    unsafe {
                        libc::kill(-(pgid as i32), libc::SIGTERM);
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    unsafe {
                        libc::kill(-(pgid as i32), libc::SIGKILL);
                    }
                }
                for task in tasks {
                    task.abort();
                }
            }
            Backend::Ssh { io_thread } => {
                let handle = io_thread.lock().expect("io thread poisoned").take();
                if let Some(handle) = handle {
                    let _ = handle.join();
                }
            }
        }
        info!("session {} closed", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::filter::CommandFilter;

    fn test_session() -> (
        Arc<Session>,
        mpsc::Sender<Vec<u8>>,
        mpsc::Receiver<Vec<u8>>,
    ) {
        let (out_tx, out_rx) = mpsc::channel(64);
        let (in_tx, in_rx) = mpsc::channel(64);
        let executor = Executor::new(out_rx, in_tx.clone());
        let session = Session::new(
            "test-session".to_string(),
            SessionMode::Local,
            String::new(),
            String::new(),
            0,
            String::new(),
            executor,
            in_tx,
            Arc::new(AtomicBool::new(false)),
            None,
            None,
            Backend::Local {
                pid: 0,
                tasks: Vec::new(),
            },
        );
        session.set_state(SessionState::Idle);
        (Arc::new(session), out_tx, in_rx)
    }

    fn permissive_policy() -> ExecPolicy {
        ExecPolicy {
            filter: Arc::new(CommandFilter::permissive()),
            sudo_env: None,
            output_save_threshold: 50 * 1024,
            default_timeout_ms: 5_000,
        }
    }

    fn sudo_cache() -> SudoCache {
        SudoCache::new(Duration::from_secs(300))
    }

    /// Pull the command id out of a framed line the session wrote.
    fn extract_id(line: &str) -> Option<String> {
        line.split("printf '\\n___CMD_START_%s___\\n' ")
            .nth(1)
            .map(|rest| rest.split(';').next().unwrap_or("").trim().to_string())
    }

    /// The bytes a shell would emit for a framed command's completion.
    fn frame_reply(id: &str, stdout: &str, rc: i32) -> Vec<u8> {
        if stdout.is_empty() {
            format!("\n___CMD_START_{id}___\n{rc}\n___CMD_END_{id}___\n").into_bytes()
        } else {
            format!("\n___CMD_START_{id}___\n{stdout}\n{rc}\n___CMD_END_{id}___\n").into_bytes()
        }
    }

    /// Answer `responses.len()` framed commands in order (the trailing ones
    /// cover the silent `pwd` reconciliation).
    fn spawn_driver(
        mut in_rx: mpsc::Receiver<Vec<u8>>,
        out_tx: mpsc::Sender<Vec<u8>>,
        responses: Vec<(&'static str, i32)>,
    ) -> tokio::task::JoinHandle<mpsc::Receiver<Vec<u8>>> {
        tokio::spawn(async move {
            for (stdout, rc) in responses {
                let written = in_rx.recv().await.expect("driver: input closed");
                let line = String::from_utf8_lossy(&written).into_owned();
                let id = extract_id(&line).expect("driver: no framed id");
                out_tx
                    .send(frame_reply(&id, stdout, rc))
                    .await
                    .expect("driver: output closed");
            }
            in_rx
        })
    }

    #[tokio::test]
    async fn exec_completes_and_reconciles_cwd() {
        let (session, out_tx, in_rx) = test_session();
        let driver = spawn_driver(in_rx, out_tx, vec![("hello", 0), ("/home/tester", 0)]);

        let result = session
            .exec(
                "echo hello",
                ExecOptions::default(),
                &permissive_policy(),
                &sudo_cache(),
            )
            .await
            .unwrap();

        assert_eq!(result.status, ExecStatus::Completed);
        assert_eq!(result.stdout, "hello");
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(session.cwd(), "/home/tester");
        assert_eq!(session.state(), SessionState::Idle);
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn blocked_command_writes_nothing_to_the_pty() {
        let (session, _out_tx, mut in_rx) = test_session();
        let policy = ExecPolicy {
            filter: Arc::new(
                CommandFilter::compile(&["rm -rf /".to_string()], &[]).unwrap(),
            ),
            ..permissive_policy()
        };

        let err = session
            .exec("rm -rf /", ExecOptions::default(), &policy, &sudo_cache())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
        assert!(err.to_string().contains("blocked"));
        // Nothing reached the PTY.
        assert!(in_rx.try_recv().is_err());
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn heredoc_rejected_before_pty() {
        let (session, _out_tx, mut in_rx) = test_session();
        let err = session
            .exec(
                "cat <<EOF > /tmp/x",
                ExecOptions::default(),
                &permissive_policy(),
                &sudo_cache(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
        assert!(err.to_string().contains("shell_file_put"));
        assert!(in_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn tail_and_head_are_mutually_exclusive() {
        let (session, _out_tx, _in_rx) = test_session();
        let err = session
            .exec(
                "ls",
                ExecOptions {
                    timeout_ms: 0,
                    tail_lines: 3,
                    head_lines: 2,
                },
                &permissive_policy(),
                &sudo_cache(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
    }

    #[tokio::test]
    async fn tail_truncation_fields() {
        let (session, out_tx, in_rx) = test_session();
        let ten_lines = "x\nxx\nxxx\nxxxx\nxxxxx\nxxxxxx\nxxxxxxx\nxxxxxxxx\nxxxxxxxxx\nxxxxxxxxxx";
        let driver = spawn_driver(in_rx, out_tx, vec![(ten_lines, 0), ("/", 0)]);

        let result = session
            .exec(
                "seq-ish",
                ExecOptions {
                    timeout_ms: 0,
                    tail_lines: 3,
                    head_lines: 0,
                },
                &permissive_policy(),
                &sudo_cache(),
            )
            .await
            .unwrap();

        assert_eq!(result.stdout, "xxxxxxxx\nxxxxxxxxx\nxxxxxxxxxx");
        assert_eq!(result.truncated, Some(true));
        assert_eq!(result.total_lines, Some(10));
        assert_eq!(result.shown_lines, Some(3));
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn password_prompt_then_provide_input_with_caching() {
        let (session, out_tx, mut in_rx) = test_session();
        let cache = sudo_cache();

        // Driver phase 1: answer the framed command with a password prompt.
        let out_tx2 = out_tx.clone();
        let prompt_driver = tokio::spawn(async move {
            let written = in_rx.recv().await.unwrap();
            let line = String::from_utf8_lossy(&written).into_owned();
            let id = extract_id(&line).unwrap();
            out_tx2
                .send(b"[sudo] password for tester: ".to_vec())
                .await
                .unwrap();
            (in_rx, id)
        });

        let result = session
            .exec("sudo true", ExecOptions::default(), &permissive_policy(), &cache)
            .await
            .unwrap();
        assert_eq!(result.status, ExecStatus::AwaitingInput);
        assert_eq!(result.prompt_type, PromptType::Password);
        assert!(result.mask_input);
        assert_eq!(session.state(), SessionState::AwaitingInput);

        let (mut in_rx, id) = prompt_driver.await.unwrap();

        // Driver phase 2: receive the password, then complete the frame and
        // answer the pwd reconciliation.
        let out_tx2 = out_tx.clone();
        let finish_driver = tokio::spawn(async move {
            let password = in_rx.recv().await.unwrap();
            assert_eq!(password, b"hunter2\n".to_vec());
            out_tx2.send(frame_reply(&id, "done", 0)).await.unwrap();
            let pwd_line = in_rx.recv().await.unwrap();
            let pwd_id = extract_id(&String::from_utf8_lossy(&pwd_line)).unwrap();
            out_tx2.send(frame_reply(&pwd_id, "/root", 0)).await.unwrap();
            in_rx
        });

        let result = session
            .provide_input("hunter2", true, &permissive_policy(), &cache)
            .await
            .unwrap();
        assert_eq!(result.status, ExecStatus::Completed);
        assert_eq!(result.stdout, "done");
        // cache_for_sudo stored the password under this session's key.
        assert_eq!(cache.get("", "").as_deref(), Some("hunter2"));
        assert_eq!(session.state(), SessionState::Idle);
        finish_driver.await.unwrap();
    }

    #[tokio::test]
    async fn provide_input_requires_awaiting_state() {
        let (session, _out_tx, _in_rx) = test_session();
        let err = session
            .provide_input("y", false, &permissive_policy(), &sudo_cache())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "precondition_failed");
    }

    #[tokio::test]
    async fn local_session_has_no_sftp_capability() {
        let (session, _out_tx, _in_rx) = test_session();
        assert_eq!(session.require_sftp().unwrap_err().code(), "precondition_failed");
        assert_eq!(
            session.require_tunnels().unwrap_err().code(),
            "precondition_failed"
        );
    }

    #[tokio::test]
    async fn closed_session_rejects_exec() {
        let (session, _out_tx, _in_rx) = test_session();
        session.set_state(SessionState::Closed);
        let err = session
            .exec("ls", ExecOptions::default(), &permissive_policy(), &sudo_cache())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }
}
