//! Local shell process and PTY management.

pub mod pty;
