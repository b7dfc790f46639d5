//! Classification of a stalled PTY buffer tail.
//!
//! When a command has produced output but no framing markers and the stream
//! has gone quiet, the executor asks this module what the shell is waiting
//! for: a password, a yes/no confirmation, or a full-screen program. The
//! answer decides between sudo auto-injection, surfacing `awaiting_input`,
//! and simply waiting longer.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

/// What the stalled command appears to be waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptType {
    Password,
    Confirmation,
    Interactive,
    None,
}

/// Number of trailing NUL bytes the peak-tty daemon writes to flag a
/// kernel-level TTY read wait.
const TTY_WAIT_NUL_RUN: usize = 13;

/// How many cursor-positioning sequences in the tail window count as a
/// full-screen program repainting (vim, less, top).
const CURSOR_MOVE_THRESHOLD: usize = 4;

/// Window of buffer tail inspected for classification.
const TAIL_WINDOW: usize = 2048;

fn password_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(password|passphrase)[^:]*:\s*$").unwrap())
}

fn sudo_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[sudo\] password for [^:]+:\s*$").unwrap())
}

fn confirmation_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(\[y/N\]|\[Y/n\]|\(yes/no\)[?:]?|continue\?)\s*[?:]?\s*$").unwrap()
    })
}

fn ansi_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").unwrap())
}

fn cursor_move_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[\d+;\d+H").unwrap())
}

/// Strip ANSI CSI escape sequences so prompt text can be matched.
pub fn strip_ansi(s: &str) -> String {
    ansi_re().replace_all(s, "").into_owned()
}

/// Classify the tail of a quiescent PTY buffer.
pub fn classify(buffer: &[u8]) -> PromptType {
    if buffer.is_empty() {
        return PromptType::None;
    }

    let tail_start = buffer.len().saturating_sub(TAIL_WINDOW);
    let tail = &buffer[tail_start..];

    // peak-tty marks a blocked TTY read with a run of NUL bytes.
    let nul_run = tail.iter().rev().take_while(|&&b| b == 0).count();
    if nul_run >= TTY_WAIT_NUL_RUN {
        return PromptType::Password;
    }

    let text = String::from_utf8_lossy(tail);
    let clean = strip_ansi(&text);
    let last_line = clean.rsplit('\n').next().unwrap_or("");

    if sudo_re().is_match(last_line) || password_re().is_match(last_line) {
        return PromptType::Password;
    }
    if confirmation_re().is_match(last_line) {
        return PromptType::Confirmation;
    }

    // Full-screen programs: alternate screen, clear-screen, or a burst of
    // absolute cursor positioning.
    if text.contains("\x1b[2J")
        || text.contains("\x1b[?1049h")
        || cursor_move_re().find_iter(&text).count() >= CURSOR_MOVE_THRESHOLD
    {
        return PromptType::Interactive;
    }

    PromptType::None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_none() {
        assert_eq!(classify(b""), PromptType::None);
    }

    #[test]
    fn plain_output_is_none() {
        assert_eq!(classify(b"compiling foo v0.1.0\n"), PromptType::None);
    }

    #[test]
    fn ssh_password_prompt() {
        assert_eq!(
            classify(b"user@host's password: "),
            PromptType::Password
        );
    }

    #[test]
    fn passphrase_prompt() {
        assert_eq!(
            classify(b"Enter passphrase for key '/home/u/.ssh/id_ed25519': "),
            PromptType::Password
        );
    }

    #[test]
    fn sudo_prompt() {
        assert_eq!(
            classify(b"[sudo] password for alice: "),
            PromptType::Password
        );
    }

    #[test]
    fn tty_wait_nul_run() {
        let mut buf = b"reading input".to_vec();
        buf.extend(std::iter::repeat(0u8).take(13));
        assert_eq!(classify(&buf), PromptType::Password);
    }

    #[test]
    fn short_nul_run_is_not_password() {
        let mut buf = b"binary output".to_vec();
        buf.extend(std::iter::repeat(0u8).take(3));
        assert_eq!(classify(&buf), PromptType::None);
    }

    #[test]
    fn yn_confirmation() {
        assert_eq!(
            classify(b"Do you want to continue? [Y/n] "),
            PromptType::Confirmation
        );
        assert_eq!(
            classify(b"Overwrite existing file? [y/N] "),
            PromptType::Confirmation
        );
    }

    #[test]
    fn yes_no_confirmation() {
        assert_eq!(
            classify(b"Are you sure you want to continue connecting (yes/no)? "),
            PromptType::Confirmation
        );
    }

    #[test]
    fn continue_confirmation() {
        assert_eq!(classify(b"Proceed? continue? "), PromptType::Confirmation);
    }

    #[test]
    fn clear_screen_is_interactive() {
        assert_eq!(classify(b"\x1b[2J\x1b[Hsome tui"), PromptType::Interactive);
    }

    #[test]
    fn alternate_screen_is_interactive() {
        assert_eq!(classify(b"\x1b[?1049h\x1b[22;0;0t"), PromptType::Interactive);
    }

    #[test]
    fn sustained_cursor_positioning_is_interactive() {
        let buf = b"\x1b[1;1Ha\x1b[2;1Hb\x1b[3;1Hc\x1b[4;1Hd".to_vec();
        assert_eq!(classify(&buf), PromptType::Interactive);
    }

    #[test]
    fn colored_password_prompt_still_matches() {
        assert_eq!(
            classify(b"\x1b[1;31mPassword:\x1b[0m "),
            PromptType::Password
        );
    }

    #[test]
    fn password_mentioned_mid_line_is_none() {
        assert_eq!(
            classify(b"password rotation completed successfully\n"),
            PromptType::None
        );
    }
}
