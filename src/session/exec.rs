//! The PTY command executor.
//!
//! An interactive shell over a PTY interleaves the current command's output,
//! background-job noise, and prompt/echo artefacts on one byte stream. The
//! executor frames every command between unique marker lines, so it can
//! return only the bytes this command produced, recover the exit code, and
//! attribute everything before the start marker to prior background
//! activity.
//!
//! The executor is transport-neutral: it reads PTY bytes from an mpsc
//! receiver and writes through an mpsc sender, so the local PTY tasks, the
//! SSH channel thread, and scripted test fakes all drive the same state
//! machine.
//!
//! ## Framing
//!
//! For command id `aabbccdd` the line written to the PTY is
//!
//! ```text
//! printf '\n___CMD_START_%s___\n' aabbccdd; <command>; rc=$?; \
//!     printf '%s\n' "$rc"; printf '___CMD_END_%s___\n' aabbccdd
//! ```
//!
//! The resolved markers never appear in the PTY echo of that line because
//! the id only occurs as a printf argument, so locating
//! `___CMD_START_aabbccdd___` on its own line is unambiguous even in
//! arbitrary stdout. Between the markers the transcript holds
//! `<stdout>\n<exit_code>\n`; the prefix before the start marker is
//! `async_output`; everything after the end marker is the next prompt and is
//! discarded.

use std::time::Duration;

use rand::RngCore;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Error, Result};
use crate::session::prompt::{self, PromptType};

/// Read-idle window after which a marker-less buffer tail is classified.
const PROMPT_IDLE: Duration = Duration::from_millis(150);

/// How long to wait for the shell prompt after sending SIGINT on timeout.
const INTERRUPT_GRACE: Duration = Duration::from_millis(500);

/// Deadline for the silent `pwd` issued after every completed command.
const CWD_REFRESH_TIMEOUT: Duration = Duration::from_secs(5);

/// ETX — what the TTY line discipline turns into SIGINT.
const CTRL_C: u8 = 0x03;

/// Outcome of driving one command (or one resumption) through the PTY.
#[derive(Debug)]
pub enum RawOutcome {
    Completed {
        command_id: String,
        stdout: String,
        exit_code: i32,
        async_output: String,
    },
    AwaitingInput {
        command_id: String,
        prompt: PromptType,
    },
    TimedOut {
        command_id: String,
        async_output: String,
    },
}

/// In-flight command retained across `awaiting_input` round-trips.
#[derive(Debug)]
struct ActiveCommand {
    id: String,
    /// A sudo password is injected at most once per attempt.
    sudo_injected: bool,
}

/// Per-session command executor. Owned behind the session's command-slot
/// mutex — only one caller drives it at a time.
pub struct Executor {
    output_rx: mpsc::Receiver<Vec<u8>>,
    input_tx: mpsc::Sender<Vec<u8>>,
    /// Rolling buffer of PTY output, CRLF-normalized.
    buffer: Vec<u8>,
    /// A trailing `\r` held back by the normalizer until the next byte.
    cr_pending: bool,
    active: Option<ActiveCommand>,
}

/// Generate a command id: hex of 4 random bytes.
pub fn new_command_id() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Build the framed shell line for a command. A single `\n` is appended by
/// the caller when writing to the PTY.
pub fn frame_command(command: &str, id: &str) -> String {
    format!(
        "printf '\\n___CMD_START_%s___\\n' {id}; {command}; rc=$?; \
         printf '%s\\n' \"$rc\"; printf '___CMD_END_%s___\\n' {id}"
    )
}

/// A parsed marker frame.
#[derive(Debug, PartialEq, Eq)]
pub struct Frame {
    pub async_output: String,
    pub stdout: String,
    pub exit_code: i32,
}

/// Locate the `___CMD_START_<id>___` / `___CMD_END_<id>___` pair in the
/// buffer. Both markers must sit on their own lines; the text between them
/// is `<stdout>\n<exit_code>\n`.
pub fn find_frame(buffer: &[u8], id: &str) -> Option<Frame> {
    let text = String::from_utf8_lossy(buffer);
    let start_marker = format!("___CMD_START_{id}___\n");
    let end_marker = format!("___CMD_END_{id}___\n");

    let start = find_line_start(&text, &start_marker, 0)?;
    let body_start = start + start_marker.len();
    let end = find_line_start(&text, &end_marker, body_start)?;

    let async_output = text[..start].to_string();
    let between = &text[body_start..end];

    // `between` is `<stdout>\n<exit_code>\n`; the separator before the rc
    // line is the command's own trailing newline.
    let trimmed = between.strip_suffix('\n').unwrap_or(between);
    let (stdout, rc_str) = match trimmed.rsplit_once('\n') {
        Some((out, rc)) => (out.to_string(), rc),
        None => (String::new(), trimmed),
    };
    let exit_code = rc_str.trim().parse::<i32>().unwrap_or(-1);

    Some(Frame {
        async_output,
        stdout,
        exit_code,
    })
}

/// Find `needle` at the start of a line (position 0 or right after `\n`),
/// searching from `from`. Returns the byte offset of the needle.
fn find_line_start(text: &str, needle: &str, from: usize) -> Option<usize> {
    let mut search = from;
    loop {
        let i = text[search..].find(needle)? + search;
        if i == 0 || text.as_bytes()[i - 1] == b'\n' {
            return Some(i);
        }
        search = i + 1;
    }
}

/// Slice stdout to the last `tail` or first `head` lines. Returns
/// `(sliced, total_lines, shown_lines)` or `None` when no truncation was
/// needed. Exactly one of `tail`/`head` must be non-zero.
pub fn slice_lines(stdout: &str, tail: usize, head: usize) -> Option<(String, usize, usize)> {
    let mut lines: Vec<&str> = stdout.split('\n').collect();
    // A trailing newline yields one empty trailing element — not a line.
    if lines.last() == Some(&"") {
        lines.pop();
    }
    let total = lines.len();
    let keep = if tail > 0 { tail } else { head };
    if keep == 0 || total <= keep {
        return None;
    }
    let shown: Vec<&str> = if tail > 0 {
        lines[total - keep..].to_vec()
    } else {
        lines[..keep].to_vec()
    };
    Some((shown.join("\n"), total, keep))
}

/// Heredocs require live PTY continuation prompts that break the framing
/// contract; detect and reject them before any byte reaches the PTY.
pub fn contains_heredoc(command: &str) -> bool {
    use std::sync::OnceLock;
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r#"<<-?\s*['"]?\w+['"]?"#).unwrap())
        .is_match(command)
}

impl Executor {
    pub fn new(output_rx: mpsc::Receiver<Vec<u8>>, input_tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            output_rx,
            input_tx,
            buffer: Vec::new(),
            cr_pending: false,
            active: None,
        }
    }

    /// Whether a command is paused at `awaiting_input`.
    pub fn has_active_command(&self) -> bool {
        self.active.is_some()
    }

    /// Drop everything buffered so far (startup banner, interrupted noise).
    pub fn discard_buffer(&mut self) {
        self.buffer.clear();
        self.cr_pending = false;
    }

    /// Append PTY bytes, folding `\r\n` into `\n` (the slave-side ONLCR
    /// translation would otherwise double every line break). Lone `\r` is
    /// preserved.
    fn append(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if self.cr_pending {
                self.cr_pending = false;
                if b == b'\n' {
                    self.buffer.push(b'\n');
                    continue;
                }
                self.buffer.push(b'\r');
            }
            if b == b'\r' {
                self.cr_pending = true;
            } else {
                self.buffer.push(b);
            }
        }
    }

    async fn write(&self, bytes: Vec<u8>) -> Result<()> {
        self.input_tx
            .send(bytes)
            .await
            .map_err(|_| Error::Internal("session input channel closed".to_string()))
    }

    /// Frame and run a fresh command. `sudo` resolves a password lazily when
    /// a password prompt is classified mid-command.
    pub async fn run_command(
        &mut self,
        command: &str,
        timeout: Duration,
        sudo: &dyn Fn() -> Option<String>,
    ) -> Result<RawOutcome> {
        let id = new_command_id();
        // Fresh attempt: anything still buffered belongs to nobody — it will
        // surface as this command's async prefix.
        self.active = Some(ActiveCommand {
            id: id.clone(),
            sudo_injected: false,
        });

        let mut line = frame_command(command, &id);
        line.push('\n');
        self.write(line.into_bytes()).await?;

        self.wait_for_result(Instant::now() + timeout, sudo).await
    }

    /// Write a line of input to a command paused at `awaiting_input` and
    /// continue parsing from the retained buffer.
    pub async fn provide_input(
        &mut self,
        input: &str,
        timeout: Duration,
        sudo: &dyn Fn() -> Option<String>,
    ) -> Result<RawOutcome> {
        if self.active.is_none() {
            return Err(Error::PreconditionFailed(
                "session is not awaiting input".to_string(),
            ));
        }
        self.write(format!("{input}\n").into_bytes()).await?;
        self.wait_for_result(Instant::now() + timeout, sudo).await
    }

    /// Write raw bytes (no newline) to a paused command — arrow keys, ^D,
    /// escape sequences — and continue parsing.
    pub async fn send_raw(
        &mut self,
        bytes: &[u8],
        timeout: Duration,
        sudo: &dyn Fn() -> Option<String>,
    ) -> Result<RawOutcome> {
        if self.active.is_none() {
            return Err(Error::PreconditionFailed(
                "session is not awaiting input".to_string(),
            ));
        }
        self.write(bytes.to_vec()).await?;
        self.wait_for_result(Instant::now() + timeout, sudo).await
    }

    /// Send SIGINT through the PTY and drain until the prompt settles.
    /// Used by `shell_interrupt` and internally on timeout. Discards the
    /// buffer and clears any active command.
    pub async fn interrupt(&mut self) -> Result<()> {
        self.write(vec![CTRL_C]).await?;
        self.drain(INTERRUPT_GRACE).await;
        self.buffer.clear();
        self.cr_pending = false;
        self.active = None;
        Ok(())
    }

    /// Read and discard output for up to `window` (initial banner/prompt,
    /// post-interrupt settling).
    pub async fn drain(&mut self, window: Duration) {
        let deadline = Instant::now() + window;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match tokio::time::timeout(deadline - now, self.output_rx.recv()).await {
                Ok(Some(bytes)) => {
                    // Appended (not dropped) so a final scan sees everything,
                    // then cleared by the caller.
                    self.append(&bytes);
                }
                Ok(None) | Err(_) => break,
            }
        }
    }

    /// Issue a silent framed `pwd` and return its stdout. Called after every
    /// completed command so `cd` is reflected in the session's cwd.
    pub async fn read_cwd(&mut self) -> Option<String> {
        let sudo = || None;
        match self.run_command("pwd", CWD_REFRESH_TIMEOUT, &sudo).await {
            Ok(RawOutcome::Completed {
                stdout, exit_code, ..
            }) if exit_code == 0 => {
                let cwd = stdout.trim();
                if cwd.is_empty() {
                    None
                } else {
                    Some(cwd.to_string())
                }
            }
            other => {
                debug!("cwd refresh did not complete: {other:?}");
                None
            }
        }
    }

    /// The parse loop: scan for the marker frame, classify quiescent tails,
    /// inject sudo passwords, and enforce the deadline.
    async fn wait_for_result(
        &mut self,
        deadline: Instant,
        sudo: &dyn Fn() -> Option<String>,
    ) -> Result<RawOutcome> {
        let id = self
            .active
            .as_ref()
            .map(|a| a.id.clone())
            .ok_or_else(|| Error::Internal("no active command".to_string()))?;

        loop {
            if let Some(frame) = find_frame(&self.buffer, &id) {
                // Everything after the end marker is the next prompt.
                self.buffer.clear();
                self.cr_pending = false;
                self.active = None;
                return Ok(RawOutcome::Completed {
                    command_id: id,
                    stdout: frame.stdout,
                    exit_code: frame.exit_code,
                    async_output: frame.async_output,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return self.timeout_path(id).await;
            }

            let slice = PROMPT_IDLE.min(deadline - now);
            match tokio::time::timeout(slice, self.output_rx.recv()).await {
                Ok(Some(bytes)) => self.append(&bytes),
                Ok(None) => {
                    self.active = None;
                    return Err(Error::Internal(
                        "session output stream closed (shell exited?)".to_string(),
                    ));
                }
                Err(_) if self.buffer.is_empty() => {}
                Err(_) => match prompt::classify(&self.buffer) {
                    PromptType::None => {}
                    PromptType::Password => {
                        let injected = self
                            .active
                            .as_ref()
                            .is_some_and(|a| a.sudo_injected);
                        if !injected {
                            if let Some(password) = sudo() {
                                debug!("injecting cached sudo password");
                                if let Some(active) = self.active.as_mut() {
                                    active.sudo_injected = true;
                                }
                                self.write(format!("{password}\n").into_bytes()).await?;
                                continue;
                            }
                        }
                        return Ok(RawOutcome::AwaitingInput {
                            command_id: id,
                            prompt: PromptType::Password,
                        });
                    }
                    prompt_type => {
                        return Ok(RawOutcome::AwaitingInput {
                            command_id: id,
                            prompt: prompt_type,
                        });
                    }
                },
            }
        }
    }

    /// Deadline expired with no frame and no prompt: SIGINT the foreground
    /// job, wait briefly for the shell to settle, and report what leaked.
    async fn timeout_path(&mut self, id: String) -> Result<RawOutcome> {
        self.write(vec![CTRL_C]).await.ok();
        self.drain(INTERRUPT_GRACE).await;
        let async_output = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        self.cr_pending = false;
        self.active = None;
        Ok(RawOutcome::TimedOut {
            command_id: id,
            async_output,
        })
    }
}
