//! Process-wide sudo password cache with TTL.
//!
//! Keyed `(host, user)`, empty host for local sessions. The TTL refreshes on
//! every read so an actively-used password stays warm. Entries are purged
//! when their session closes and by the periodic background sweep.
//!
//! Passwords never leave this module except as the injected PTY write; they
//! are never logged and never appear in tool results.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct CacheEntry {
    password: String,
    expires_at: Instant,
}

/// Sudo password cache.
pub struct SudoCache {
    inner: Mutex<Inner>,
}

struct Inner {
    ttl: Duration,
    entries: HashMap<(String, String), CacheEntry>,
}

impl SudoCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                ttl,
                entries: HashMap::new(),
            }),
        }
    }

    /// Store a password for `(host, user)`.
    pub fn put(&self, host: &str, user: &str, password: &str) {
        let mut inner = self.inner.lock().expect("sudo cache poisoned");
        let expires_at = Instant::now() + inner.ttl;
        inner.entries.insert(
            (host.to_string(), user.to_string()),
            CacheEntry {
                password: password.to_string(),
                expires_at,
            },
        );
    }

    /// Fetch a cached password, refreshing its TTL. Expired entries are
    /// removed and report as absent.
    pub fn get(&self, host: &str, user: &str) -> Option<String> {
        let mut inner = self.inner.lock().expect("sudo cache poisoned");
        let ttl = inner.ttl;
        let key = (host.to_string(), user.to_string());
        let now = Instant::now();
        match inner.entries.get_mut(&key) {
            Some(entry) if entry.expires_at > now => {
                entry.expires_at = now + ttl;
                Some(entry.password.clone())
            }
            Some(_) => {
                inner.entries.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Wipe the entry for a key (called on session close).
    pub fn purge(&self, host: &str, user: &str) {
        let mut inner = self.inner.lock().expect("sudo cache poisoned");
        inner
            .entries
            .remove(&(host.to_string(), user.to_string()));
    }

    /// Drop all expired entries. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let mut inner = self.inner.lock().expect("sudo cache poisoned");
        let now = Instant::now();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| e.expires_at > now);
        before - inner.entries.len()
    }

    /// Replace the TTL (config hot-reload). Applies to entries stored or
    /// refreshed from now on.
    pub fn set_ttl(&self, ttl: Duration) {
        self.inner.lock().expect("sudo cache poisoned").ttl = ttl;
    }
}
