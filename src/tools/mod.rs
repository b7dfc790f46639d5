//! Tool definitions and dispatch.
//!
//! Each tool is defined as a JSON schema (returned by [`tool_definitions`])
//! and handled by an async function dispatched from [`handle_tool_call`].
//! Handlers parse their arguments into typed structs once at entry, call
//! into the session/transfer/tunnel machinery, and serialize the outcome
//! into the standard tool-result envelope. Errors become structured
//! `{error, code}` payloads with `isError: true` — never transport faults.

pub mod args;
mod file_tools;
mod session_tools;
mod tunnel_tools;

use std::sync::Arc;

use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::server::Server;

/// Result of one tool invocation, in MCP envelope shape.
pub struct ToolCallResult {
    pub content: Vec<Value>,
    pub is_error: bool,
}

impl ToolCallResult {
    fn from_outcome(outcome: Result<Value>) -> Self {
        match outcome {
            Ok(payload) => Self {
                content: vec![json!({
                    "type": "text",
                    "text": payload.to_string(),
                })],
                is_error: false,
            },
            Err(e) => Self {
                content: vec![json!({
                    "type": "text",
                    "text": json!({
                        "error": e.to_string(),
                        "code": e.code(),
                    })
                    .to_string(),
                })],
                is_error: true,
            },
        }
    }
}

/// Dispatch a `tools/call` to its handler.
pub async fn handle_tool_call(name: &str, arguments: &Value, server: &Arc<Server>) -> ToolCallResult {
    let outcome = match name {
        "shell_session_create" => session_tools::session_create(arguments, server).await,
        "shell_session_list" => session_tools::session_list(server).await,
        "shell_session_status" => session_tools::session_status(arguments, server).await,
        "shell_session_close" => session_tools::session_close(arguments, server).await,
        "shell_exec" => session_tools::exec(arguments, server).await,
        "shell_provide_input" => session_tools::provide_input(arguments, server).await,
        "shell_send_raw" => session_tools::send_raw(arguments, server).await,
        "shell_interrupt" => session_tools::interrupt(arguments, server).await,
        "shell_sudo_auth" => session_tools::sudo_auth(arguments, server).await,
        "shell_server_list" => session_tools::server_list(server).await,
        "shell_server_test" => session_tools::server_test(arguments, server).await,
        "shell_config_add" => session_tools::config_add(arguments, server).await,
        "shell_file_get" => file_tools::file_get(arguments, server).await,
        "shell_file_put" => file_tools::file_put(arguments, server).await,
        "shell_file_mv" => file_tools::file_mv(arguments, server).await,
        "shell_dir_get" => file_tools::dir_get(arguments, server).await,
        "shell_dir_put" => file_tools::dir_put(arguments, server).await,
        "shell_file_get_chunked" => file_tools::file_get_chunked(arguments, server).await,
        "shell_file_put_chunked" => file_tools::file_put_chunked(arguments, server).await,
        "shell_transfer_status" => file_tools::transfer_status(arguments).await,
        "shell_transfer_resume" => file_tools::transfer_resume(arguments, server).await,
        "shell_tunnel_create" => tunnel_tools::tunnel_create(arguments, server).await,
        "shell_tunnel_list" => tunnel_tools::tunnel_list(arguments, server).await,
        "shell_tunnel_close" => tunnel_tools::tunnel_close(arguments, server).await,
        "shell_tunnel_restore" => tunnel_tools::tunnel_restore(arguments, server).await,
        other => Err(Error::NotFound(format!("unknown tool: {other}"))),
    };
    ToolCallResult::from_outcome(outcome)
}

/// All tool definitions advertised by `tools/list`.
pub fn tool_definitions() -> Vec<Value> {
    vec![
        json!({
            "name": "shell_session_create",
            "description": "Create a persistent shell session. mode=local spawns the login shell under a PTY; mode=ssh connects to a remote host (agent, key file, or configured password auth) and opens an interactive shell plus SFTP.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "mode": { "type": "string", "enum": ["local", "ssh"], "description": "Session transport. Default local." },
                    "host": { "type": "string", "description": "SSH host (required for mode=ssh)." },
                    "port": { "type": "integer", "description": "SSH port. Default 22." },
                    "user": { "type": "string", "description": "SSH user (required for mode=ssh)." },
                    "key_path": { "type": "string", "description": "Private key file. Overrides configured server auth." }
                },
                "additionalProperties": false
            }
        }),
        json!({
            "name": "shell_session_list",
            "description": "List active shell sessions with state, cwd, and connection metadata.",
            "inputSchema": { "type": "object", "properties": {}, "additionalProperties": false }
        }),
        json!({
            "name": "shell_session_status",
            "description": "Status of one session: state, cwd, host/user, timestamps, tunnel count.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "session_id": { "type": "string" }
                },
                "required": ["session_id"],
                "additionalProperties": false
            }
        }),
        json!({
            "name": "shell_session_close",
            "description": "Close a session: terminate the shell, tear down SSH/SFTP and tunnels, wipe cached sudo credentials.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "session_id": { "type": "string" }
                },
                "required": ["session_id"],
                "additionalProperties": false
            }
        }),
        json!({
            "name": "shell_exec",
            "description": "Run a command in a session's interactive shell and return its stdout, exit code, and any async output from prior background jobs. Detects password/confirmation/TUI prompts and returns status=awaiting_input instead of hanging; use shell_provide_input to answer. Heredocs are rejected — use shell_file_put or printf.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "session_id": { "type": "string" },
                    "command": { "type": "string" },
                    "timeout_ms": { "type": "integer", "description": "Deadline in milliseconds. Default 30000." },
                    "tail_lines": { "type": "integer", "description": "Return only the last N lines. Mutually exclusive with head_lines." },
                    "head_lines": { "type": "integer", "description": "Return only the first N lines. Mutually exclusive with tail_lines." }
                },
                "required": ["session_id", "command"],
                "additionalProperties": false
            }
        }),
        json!({
            "name": "shell_provide_input",
            "description": "Send a line of input to a command waiting at a prompt (newline appended automatically). Set cache_for_sudo=true when answering a sudo password prompt so future prompts are answered transparently.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "session_id": { "type": "string" },
                    "input": { "type": "string" },
                    "cache_for_sudo": { "type": "boolean", "description": "Cache this input as the session's sudo password. Default false." }
                },
                "required": ["session_id", "input"],
                "additionalProperties": false
            }
        }),
        json!({
            "name": "shell_send_raw",
            "description": "Send raw bytes to a waiting command without a trailing newline — arrow keys (\\u001b[A), Ctrl-D (\\u0004), Escape, and other control sequences.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "session_id": { "type": "string" },
                    "input": { "type": "string" }
                },
                "required": ["session_id", "input"],
                "additionalProperties": false
            }
        }),
        json!({
            "name": "shell_interrupt",
            "description": "Send Ctrl-C to the session's foreground job and settle the shell back to a prompt.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "session_id": { "type": "string" }
                },
                "required": ["session_id"],
                "additionalProperties": false
            }
        }),
        json!({
            "name": "shell_sudo_auth",
            "description": "Load the sudo password for this session's server from its configured environment variable into the sudo cache, so sudo prompts are answered transparently.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "session_id": { "type": "string" }
                },
                "required": ["session_id"],
                "additionalProperties": false
            }
        }),
        json!({
            "name": "shell_server_list",
            "description": "List configured SSH servers (never reveals passwords).",
            "inputSchema": { "type": "object", "properties": {}, "additionalProperties": false }
        }),
        json!({
            "name": "shell_server_test",
            "description": "Test connectivity to a configured server: dial, authenticate, disconnect. No session is created.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "name": { "type": "string", "description": "Configured server name." },
                    "timeout_ms": { "type": "integer", "description": "Overall test deadline. Default 15000." }
                },
                "required": ["name"],
                "additionalProperties": false
            }
        }),
        json!({
            "name": "shell_config_add",
            "description": "Add a server entry to the configuration and persist it.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "host": { "type": "string" },
                    "user": { "type": "string" },
                    "port": { "type": "integer", "description": "Default 22." },
                    "auth_type": { "type": "string", "enum": ["agent", "key", "password"], "description": "Default agent." },
                    "key_path": { "type": "string" },
                    "sudo_password_env": { "type": "string", "description": "Env var holding the sudo password for this host." }
                },
                "required": ["name", "host", "user"],
                "additionalProperties": false
            }
        }),
        json!({
            "name": "shell_file_get",
            "description": "Copy one file from the session's filesystem (remote for SSH sessions) to a local path. Atomic write, SHA-256 checksum, optional mtime preservation and gzip.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "session_id": { "type": "string" },
                    "remote_path": { "type": "string" },
                    "local_path": { "type": "string" },
                    "overwrite": { "type": "boolean", "description": "Replace an existing destination. Default false." },
                    "preserve_times": { "type": "boolean", "description": "Copy the source mtime. Default false." },
                    "compress": { "type": "boolean", "description": "Write the local destination gzip-compressed. Default false." },
                    "expected_checksum": { "type": "string", "description": "Fail unless the source SHA-256 matches." }
                },
                "required": ["session_id", "remote_path", "local_path"],
                "additionalProperties": false
            }
        }),
        json!({
            "name": "shell_file_put",
            "description": "Copy one local file to the session's filesystem (remote for SSH sessions). Atomic write, SHA-256 checksum, optional mtime preservation; compress=true decompresses a local .gz while writing.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "session_id": { "type": "string" },
                    "local_path": { "type": "string" },
                    "remote_path": { "type": "string" },
                    "overwrite": { "type": "boolean", "description": "Replace an existing destination. Default false." },
                    "preserve_times": { "type": "boolean", "description": "Copy the source mtime. Default false." },
                    "compress": { "type": "boolean", "description": "Treat local_path as gzip and decompress while writing. Default false." },
                    "expected_checksum": { "type": "string", "description": "Fail unless the payload SHA-256 matches." }
                },
                "required": ["session_id", "local_path", "remote_path"],
                "additionalProperties": false
            }
        }),
        json!({
            "name": "shell_file_mv",
            "description": "Rename/move a file on the session's filesystem (remote for SSH sessions).",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "session_id": { "type": "string" },
                    "source_path": { "type": "string" },
                    "destination_path": { "type": "string" },
                    "overwrite": { "type": "boolean", "description": "Replace an existing destination. Default false." }
                },
                "required": ["session_id", "source_path", "destination_path"],
                "additionalProperties": false
            }
        }),
        json!({
            "name": "shell_dir_get",
            "description": "Recursively download a directory tree. Supports a ** glob pattern, symlink policy (skip/preserve/follow), depth cap, and per-entry error accumulation — failing entries are reported, the rest still transfer.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "session_id": { "type": "string" },
                    "remote_path": { "type": "string" },
                    "local_path": { "type": "string" },
                    "pattern": { "type": "string", "description": "Doublestar glob over relative paths. Default **." },
                    "preserve": { "type": "boolean", "description": "Preserve file mtimes. Default false." },
                    "symlinks": { "type": "string", "enum": ["skip", "preserve", "follow"], "description": "Symlink policy. Default skip." },
                    "max_depth": { "type": "integer", "description": "Recursion depth cap. Default 20." },
                    "overwrite": { "type": "boolean", "description": "Replace existing destination files. Default false." }
                },
                "required": ["session_id", "remote_path", "local_path"],
                "additionalProperties": false
            }
        }),
        json!({
            "name": "shell_dir_put",
            "description": "Recursively upload a directory tree. Same filters and semantics as shell_dir_get.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "session_id": { "type": "string" },
                    "remote_path": { "type": "string" },
                    "local_path": { "type": "string" },
                    "pattern": { "type": "string", "description": "Doublestar glob over relative paths. Default **." },
                    "preserve": { "type": "boolean", "description": "Preserve file mtimes. Default false." },
                    "symlinks": { "type": "string", "enum": ["skip", "preserve", "follow"], "description": "Symlink policy. Default skip." },
                    "max_depth": { "type": "integer", "description": "Recursion depth cap. Default 20." },
                    "overwrite": { "type": "boolean", "description": "Replace existing destination files. Default false." }
                },
                "required": ["session_id", "remote_path", "local_path"],
                "additionalProperties": false
            }
        }),
        json!({
            "name": "shell_file_get_chunked",
            "description": "Download a large file in verified chunks with an on-disk manifest. If interrupted, shell_transfer_resume continues from the first incomplete chunk. SSH sessions only.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "session_id": { "type": "string" },
                    "remote_path": { "type": "string" },
                    "local_path": { "type": "string" },
                    "chunk_size": { "type": "integer", "description": "Chunk size in bytes, clamped to [1 KiB, 10 MiB]. Default 1 MiB." }
                },
                "required": ["session_id", "remote_path", "local_path"],
                "additionalProperties": false
            }
        }),
        json!({
            "name": "shell_file_put_chunked",
            "description": "Upload a large file in verified chunks with an on-disk manifest (resumable). SSH sessions only.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "session_id": { "type": "string" },
                    "remote_path": { "type": "string" },
                    "local_path": { "type": "string" },
                    "chunk_size": { "type": "integer", "description": "Chunk size in bytes, clamped to [1 KiB, 10 MiB]. Default 1 MiB." }
                },
                "required": ["session_id", "remote_path", "local_path"],
                "additionalProperties": false
            }
        }),
        json!({
            "name": "shell_transfer_status",
            "description": "Progress of a chunked transfer, derived from its manifest file alone. Works without a live session.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "manifest_path": { "type": "string", "description": "Path to the .transfer manifest." }
                },
                "required": ["manifest_path"],
                "additionalProperties": false
            }
        }),
        json!({
            "name": "shell_transfer_resume",
            "description": "Resume an interrupted chunked transfer from its manifest. Completed chunks are skipped, their checksums preserved.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "session_id": { "type": "string" },
                    "manifest_path": { "type": "string" }
                },
                "required": ["session_id", "manifest_path"],
                "additionalProperties": false
            }
        }),
        json!({
            "name": "shell_tunnel_create",
            "description": "Create a TCP forward on an SSH session. kind=local forwards a local port to target_host:target_port on the remote network; kind=reverse forwards a remote port back to a local target.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "session_id": { "type": "string" },
                    "kind": { "type": "string", "enum": ["local", "reverse"], "description": "Default local." },
                    "bind_port": { "type": "integer", "description": "Local bind port (local) or remote listen port (reverse)." },
                    "target_host": { "type": "string" },
                    "target_port": { "type": "integer" },
                    "save": { "type": "boolean", "description": "Remember for shell_tunnel_restore. Default false." }
                },
                "required": ["session_id", "bind_port", "target_host", "target_port"],
                "additionalProperties": false
            }
        }),
        json!({
            "name": "shell_tunnel_list",
            "description": "List active tunnels on a session.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "session_id": { "type": "string" }
                },
                "required": ["session_id"],
                "additionalProperties": false
            }
        }),
        json!({
            "name": "shell_tunnel_close",
            "description": "Close one tunnel by id.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "session_id": { "type": "string" },
                    "tunnel_id": { "type": "integer" }
                },
                "required": ["session_id", "tunnel_id"],
                "additionalProperties": false
            }
        }),
        json!({
            "name": "shell_tunnel_restore",
            "description": "Re-create all tunnels the session saved with save=true (after a reconnect).",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "session_id": { "type": "string" }
                },
                "required": ["session_id"],
                "additionalProperties": false
            }
        }),
    ]
}
