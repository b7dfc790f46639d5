#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::unused_async)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! shell-mcp library — remote shell control plane for AI agents.
//!
//! The binary speaks MCP (JSON-RPC 2.0 over stdio) and multiplexes
//! persistent shell sessions — a local PTY or an authenticated SSH
//! connection with an interactive shell — behind a small tool surface:
//!
//! - `mcp` — stdio JSON-RPC loop
//! - `tools` — tool definitions and dispatch
//! - `session` — session manager and the PTY command executor
//! - `shell` — local PTY allocation and shell spawning
//! - `ssh` — SSH connections, the SFTP capability, and port tunnels
//! - `transfer` — whole-file, chunked-resumable, and recursive transfers
//! - `security` — command filter, auth rate limiter, sudo cache
//! - `config` — YAML configuration loading

pub mod config;
pub mod error;
pub mod mcp;
pub mod security;
pub mod server;
pub mod session;
pub mod shell;
pub mod ssh;
pub mod tools;
pub mod transfer;
pub mod util;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use error::{Error, Result};
pub use server::Server;
pub use session::SessionManager;
