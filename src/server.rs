//! Shared server state: configuration plus the process-wide security
//! machinery, owned in one place and swapped atomically on hot-reload.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{info, warn};

use crate::config::{Config, ServerEntry};
use crate::error::{Error, Result};
use crate::security::ratelimit::RateLimitPolicy;
use crate::security::{AuthRateLimiter, CommandFilter, SudoCache};
use crate::session::session::{ExecPolicy, Session};
use crate::session::SessionManager;

/// The server value every tool handler receives.
pub struct Server {
    config: RwLock<Arc<Config>>,
    /// Where the config was loaded from; `shell_config_add` persists here.
    config_path: Option<String>,
    pub sessions: SessionManager,
    pub sudo_cache: SudoCache,
    pub limiter: AuthRateLimiter,
    filter: RwLock<Arc<CommandFilter>>,
}

impl Server {
    pub fn new(config: Config, config_path: Option<String>) -> Self {
        let filter = CommandFilter::compile_or_permissive(
            &config.security.command_blocklist,
            &config.security.command_allowlist,
        );
        let limiter = AuthRateLimiter::new(RateLimitPolicy {
            max_failures: config.security.max_auth_failures,
            window: Duration::from_secs(config.security.auth_failure_window_secs),
            lockout: Duration::from_secs(config.security.auth_lockout_secs),
        });
        let sudo_cache = SudoCache::new(Duration::from_secs(config.security.sudo_cache_ttl_secs));
        let sessions = SessionManager::new(config.limits.max_sessions, config.recording.clone());

        Self {
            config: RwLock::new(Arc::new(config)),
            config_path,
            sessions,
            sudo_cache,
            limiter,
            filter: RwLock::new(Arc::new(filter)),
        }
    }

    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config.read().expect("config lock poisoned"))
    }

    pub fn filter(&self) -> Arc<CommandFilter> {
        Arc::clone(&self.filter.read().expect("filter lock poisoned"))
    }

    /// Hot-reload: atomically replace the command filter and security
    /// tunables. In-flight sessions keep running; a failed filter compile
    /// preserves the previous filter (fail-open on reload, not on boot).
    pub fn update_config(&self, new: Config) {
        match CommandFilter::compile(
            &new.security.command_blocklist,
            &new.security.command_allowlist,
        ) {
            Ok(filter) => {
                *self.filter.write().expect("filter lock poisoned") = Arc::new(filter);
            }
            Err(e) => {
                warn!("config reload: invalid filter pattern ({e}), keeping previous filter");
            }
        }
        self.limiter.set_policy(RateLimitPolicy {
            max_failures: new.security.max_auth_failures,
            window: Duration::from_secs(new.security.auth_failure_window_secs),
            lockout: Duration::from_secs(new.security.auth_lockout_secs),
        });
        self.sudo_cache
            .set_ttl(Duration::from_secs(new.security.sudo_cache_ttl_secs));
        *self.config.write().expect("config lock poisoned") = Arc::new(new);
        info!("configuration reloaded");
    }

    /// Add a server entry and persist the config file.
    pub fn add_server(&self, entry: ServerEntry) -> Result<()> {
        let current = self.config();
        if current.server(&entry.name).is_some() {
            return Err(Error::InvalidArgument(format!(
                "server `{}` already exists",
                entry.name
            )));
        }
        let mut updated = (*current).clone();
        updated.servers.push(entry);
        if let Some(ref path) = self.config_path {
            updated.save(path)?;
        }
        *self.config.write().expect("config lock poisoned") = Arc::new(updated);
        Ok(())
    }

    /// Build the per-call execution policy snapshot for a session.
    pub fn exec_policy_for(&self, session: &Session) -> ExecPolicy {
        let config = self.config();
        let sudo_env = config
            .server_for(&session.host, &session.user)
            .and_then(|s| s.sudo_password_env.clone());
        ExecPolicy {
            filter: self.filter(),
            sudo_env,
            output_save_threshold: config.limits.output_save_threshold,
            default_timeout_ms: config.limits.exec_timeout_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::filter::Verdict;

    fn config_with_blocklist(patterns: &[&str]) -> Config {
        let mut config = Config::default();
        config.security.command_blocklist =
            patterns.iter().map(|s| (*s).to_string()).collect();
        config
    }

    #[test]
    fn filter_built_from_config() {
        let server = Server::new(config_with_blocklist(&["rm -rf /"]), None);
        assert!(matches!(
            server.filter().evaluate("rm -rf /"),
            Verdict::Blocked(_)
        ));
    }

    #[test]
    fn reload_swaps_filter() {
        let server = Server::new(config_with_blocklist(&["rm -rf /"]), None);
        server.update_config(config_with_blocklist(&["^shutdown"]));
        assert!(matches!(
            server.filter().evaluate("rm -rf /"),
            Verdict::Allowed
        ));
        assert!(matches!(
            server.filter().evaluate("shutdown -h now"),
            Verdict::Blocked(_)
        ));
    }

    #[test]
    fn reload_with_bad_pattern_keeps_previous_filter() {
        let server = Server::new(config_with_blocklist(&["rm -rf /"]), None);
        server.update_config(config_with_blocklist(&["(unclosed"]));
        // Previous deny list still in force.
        assert!(matches!(
            server.filter().evaluate("rm -rf /"),
            Verdict::Blocked(_)
        ));
    }

    #[test]
    fn add_server_rejects_duplicates() {
        let server = Server::new(Config::default(), None);
        let entry = ServerEntry {
            name: "web".to_string(),
            host: "web.example".to_string(),
            port: 22,
            user: "deploy".to_string(),
            auth_type: "agent".to_string(),
            key_path: None,
            password_env: None,
            sudo_password_env: None,
        };
        server.add_server(entry.clone()).unwrap();
        let err = server.add_server(entry).unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
    }
}
