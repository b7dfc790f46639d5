//! Configuration loading and defaults.
//!
//! Configuration lives in a YAML file (path via `--config <path>`, or
//! `shell-mcp.yaml` in CWD, falling back to compiled defaults):
//!
//! ```yaml
//! servers:
//!   - name: build-box
//!     host: build.example.com
//!     port: 22
//!     user: ci
//!     auth_type: key          # agent | key | password
//!     key_path: ~/.ssh/id_ed25519
//!     sudo_password_env: BUILD_BOX_SUDO
//!
//! security:
//!   command_blocklist: ["rm -rf /"]
//!   command_allowlist: []
//!   sudo_cache_ttl_secs: 300
//!   max_auth_failures: 5
//!   auth_failure_window_secs: 900
//!   auth_lockout_secs: 900
//!
//! recording:
//!   enabled: false
//!   path: ~/.shell-mcp/recordings
//!
//! limits:
//!   max_sessions: 20
//!   exec_timeout_ms: 30000
//!   output_save_threshold: 51200
//!   default_chunk_size: 1048576
//!
//! logging:
//!   level: info
//! ```
//!
//! `RUST_LOG` overrides `logging.level`. Values named by `sudo_password_env`
//! are read from the process environment at use time and never logged.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration, deserialized from YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// A named SSH server the orchestrator can open sessions against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    pub name: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    /// `agent` | `key` | `password`.
    #[serde(default = "default_auth_type")]
    pub auth_type: String,
    /// Private key path (auth_type = key).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
    /// Env var holding the SSH password (auth_type = password).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
    /// Env var holding the sudo password for this host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sudo_password_env: Option<String>,
}

/// Cross-session security policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Commands matching any of these regexes are refused (deny wins).
    #[serde(default)]
    pub command_blocklist: Vec<String>,
    /// When non-empty, a command must match at least one of these.
    #[serde(default)]
    pub command_allowlist: Vec<String>,
    /// Sudo password cache TTL in seconds (default 300).
    #[serde(default = "default_sudo_cache_ttl")]
    pub sudo_cache_ttl_secs: u64,
    /// Consecutive auth failures before lockout (default 5).
    #[serde(default = "default_max_auth_failures")]
    pub max_auth_failures: u32,
    /// Window in which failures accumulate, seconds (default 900).
    #[serde(default = "default_auth_window")]
    pub auth_failure_window_secs: u64,
    /// Lockout duration after the limit is hit, seconds (default 900).
    #[serde(default = "default_auth_lockout")]
    pub auth_lockout_secs: u64,
}

/// Session transcript recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_recording_path")]
    pub path: String,
}

/// Resource limits and executor thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum concurrent sessions (default 20).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Default `shell_exec` timeout in milliseconds (default 30 000).
    #[serde(default = "default_exec_timeout_ms")]
    pub exec_timeout_ms: u64,
    /// Stdout byte length above which output is saved to disk (default 50 KiB).
    #[serde(default = "default_output_save_threshold")]
    pub output_save_threshold: usize,
    /// Default chunk size for chunked transfers (default 1 MiB).
    #[serde(default = "default_chunk_size")]
    pub default_chunk_size: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_ssh_port() -> u16 {
    22
}
fn default_auth_type() -> String {
    "agent".to_string()
}
fn default_sudo_cache_ttl() -> u64 {
    300
}
fn default_max_auth_failures() -> u32 {
    5
}
fn default_auth_window() -> u64 {
    900
}
fn default_auth_lockout() -> u64 {
    900
}
fn default_recording_path() -> String {
    "~/.shell-mcp/recordings".to_string()
}
fn default_max_sessions() -> usize {
    20
}
fn default_exec_timeout_ms() -> u64 {
    30_000
}
fn default_output_save_threshold() -> usize {
    50 * 1024
}
fn default_chunk_size() -> u64 {
    1024 * 1024
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            command_blocklist: Vec::new(),
            command_allowlist: Vec::new(),
            sudo_cache_ttl_secs: default_sudo_cache_ttl(),
            max_auth_failures: default_max_auth_failures(),
            auth_failure_window_secs: default_auth_window(),
            auth_lockout_secs: default_auth_lockout(),
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_recording_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            exec_timeout_ms: default_exec_timeout_ms(),
            output_save_threshold: default_output_save_threshold(),
            default_chunk_size: default_chunk_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration: explicit path, else `shell-mcp.yaml` in CWD, else
    /// compiled defaults. A missing explicit path is an error; a malformed
    /// file is an error (startup must not silently drop user policy).
    pub fn load(path: Option<&str>) -> Result<Self> {
        let content = if let Some(p) = path {
            Some(
                std::fs::read_to_string(p)
                    .map_err(|e| Error::LocalIo(format!("config file {p}: {e}")))?,
            )
        } else if Path::new("shell-mcp.yaml").exists() {
            Some(
                std::fs::read_to_string("shell-mcp.yaml")
                    .map_err(|e| Error::LocalIo(format!("shell-mcp.yaml: {e}")))?,
            )
        } else {
            None
        };

        match content {
            Some(text) => serde_yaml::from_str(&text)
                .map_err(|e| Error::InvalidArgument(format!("config parse error: {e}"))),
            None => Ok(Config::default()),
        }
    }

    /// Persist the configuration back to a YAML file.
    pub fn save(&self, path: &str) -> Result<()> {
        let text = serde_yaml::to_string(self)
            .map_err(|e| Error::Internal(format!("config serialize: {e}")))?;
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| Error::local(path, &e))?;
            }
        }
        std::fs::write(path, text).map_err(|e| Error::local(path, &e))
    }

    /// Look up a configured server by name.
    pub fn server(&self, name: &str) -> Option<&ServerEntry> {
        self.servers.iter().find(|s| s.name == name)
    }

    /// Find the server entry matching a live connection's (host, user).
    pub fn server_for(&self, host: &str, user: &str) -> Option<&ServerEntry> {
        self.servers
            .iter()
            .find(|s| s.host == host && s.user == user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_empty() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.limits.exec_timeout_ms, 30_000);
        assert_eq!(cfg.security.max_auth_failures, 5);
        assert_eq!(cfg.limits.default_chunk_size, 1024 * 1024);
        assert!(!cfg.recording.enabled);
    }

    #[test]
    fn server_lookup() {
        let cfg: Config = serde_yaml::from_str(
            "servers:\n  - name: web\n    host: web.example\n    user: deploy\n",
        )
        .unwrap();
        assert_eq!(cfg.server("web").unwrap().port, 22);
        assert_eq!(cfg.server("web").unwrap().auth_type, "agent");
        assert!(cfg.server("db").is_none());
        assert!(cfg.server_for("web.example", "deploy").is_some());
        assert!(cfg.server_for("web.example", "other").is_none());
    }

    #[test]
    fn security_lists_parse() {
        let cfg: Config = serde_yaml::from_str(
            "security:\n  command_blocklist: [\"rm -rf /\"]\n  sudo_cache_ttl_secs: 60\n",
        )
        .unwrap();
        assert_eq!(cfg.security.command_blocklist.len(), 1);
        assert_eq!(cfg.security.sudo_cache_ttl_secs, 60);
        // unspecified fields keep their defaults
        assert_eq!(cfg.security.auth_lockout_secs, 900);
    }
}
