//! Typed argument structs for every tool, deserialized once at the
//! dispatcher boundary. Untyped JSON never travels past this module.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// Deserialize tool-call arguments, converting serde failures (missing or
/// ill-typed fields) into `invalid_argument` with the serde message, which
/// names the offending field.
pub fn parse<T: DeserializeOwned>(args: &Value) -> Result<T> {
    serde_json::from_value(args.clone())
        .map_err(|e| Error::InvalidArgument(format!("invalid arguments: {e}")))
}

fn default_mode() -> String {
    "local".to_string()
}
fn default_ssh_port() -> u16 {
    22
}
fn default_pattern() -> String {
    "**".to_string()
}
fn default_symlinks() -> String {
    "skip".to_string()
}
fn default_max_depth() -> u32 {
    20
}

#[derive(Debug, Deserialize)]
pub struct SessionCreateArgs {
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub key_path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SessionIdArgs {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ExecArgs {
    pub session_id: String,
    pub command: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub tail_lines: Option<usize>,
    #[serde(default)]
    pub head_lines: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ProvideInputArgs {
    pub session_id: String,
    pub input: String,
    #[serde(default)]
    pub cache_for_sudo: bool,
}

#[derive(Debug, Deserialize)]
pub struct SendRawArgs {
    pub session_id: String,
    pub input: String,
}

#[derive(Debug, Deserialize)]
pub struct ServerTestArgs {
    pub name: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct FileGetArgs {
    pub session_id: String,
    pub remote_path: String,
    pub local_path: String,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default)]
    pub preserve_times: bool,
    #[serde(default)]
    pub compress: bool,
    #[serde(default)]
    pub expected_checksum: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FilePutArgs {
    pub session_id: String,
    pub local_path: String,
    pub remote_path: String,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default)]
    pub preserve_times: bool,
    #[serde(default)]
    pub compress: bool,
    #[serde(default)]
    pub expected_checksum: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FileMvArgs {
    pub session_id: String,
    pub source_path: String,
    pub destination_path: String,
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Deserialize)]
pub struct DirTransferArgs {
    pub session_id: String,
    pub remote_path: String,
    pub local_path: String,
    #[serde(default = "default_pattern")]
    pub pattern: String,
    /// Preserve file modification times.
    #[serde(default)]
    pub preserve: bool,
    #[serde(default = "default_symlinks")]
    pub symlinks: String,
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Deserialize)]
pub struct ChunkedArgs {
    pub session_id: String,
    pub remote_path: String,
    pub local_path: String,
    #[serde(default)]
    pub chunk_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct TransferStatusArgs {
    pub manifest_path: String,
}

#[derive(Debug, Deserialize)]
pub struct TransferResumeArgs {
    pub session_id: String,
    pub manifest_path: String,
}

#[derive(Debug, Deserialize)]
pub struct TunnelCreateArgs {
    pub session_id: String,
    /// `local` or `reverse`.
    #[serde(default = "default_tunnel_kind")]
    pub kind: String,
    pub bind_port: u16,
    pub target_host: String,
    pub target_port: u16,
    /// Remember this tunnel for `shell_tunnel_restore`.
    #[serde(default)]
    pub save: bool,
}

fn default_tunnel_kind() -> String {
    "local".to_string()
}

#[derive(Debug, Deserialize)]
pub struct TunnelCloseArgs {
    pub session_id: String,
    pub tunnel_id: u64,
}

#[derive(Debug, Deserialize)]
pub struct ConfigAddArgs {
    pub name: String,
    pub host: String,
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub auth_type: Option<String>,
    #[serde(default)]
    pub key_path: Option<String>,
    #[serde(default)]
    pub sudo_password_env: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_required_field_is_invalid_argument() {
        let err = parse::<ExecArgs>(&json!({ "session_id": "s" })).unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
        assert!(err.to_string().contains("command"));
    }

    #[test]
    fn defaults_fill_in() {
        let args: SessionCreateArgs = parse(&json!({})).unwrap();
        assert_eq!(args.mode, "local");
        assert_eq!(args.port, 22);

        let args: DirTransferArgs = parse(&json!({
            "session_id": "s", "remote_path": "/r", "local_path": "/l"
        }))
        .unwrap();
        assert_eq!(args.pattern, "**");
        assert_eq!(args.symlinks, "skip");
        assert_eq!(args.max_depth, 20);
        assert!(!args.overwrite);
    }

    #[test]
    fn wrong_type_is_invalid_argument() {
        let err = parse::<ExecArgs>(&json!({
            "session_id": "s", "command": "ls", "timeout_ms": "soon"
        }))
        .unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
    }
}
