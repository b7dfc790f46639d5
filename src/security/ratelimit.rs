//! Per-(host, user) auth failure counter with lockout.
//!
//! Consecutive SSH auth failures within a rolling window trigger a lockout;
//! further connection attempts against that (host, user) are refused before
//! the SSH dial is even attempted. A successful auth clears the counter.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Tunables, swapped as a unit on config hot-reload.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub max_failures: u32,
    pub window: Duration,
    pub lockout: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_failures: 5,
            window: Duration::from_secs(900),
            lockout: Duration::from_secs(900),
        }
    }
}

#[derive(Debug)]
struct FailureState {
    count: u32,
    window_start: Instant,
    locked_until: Option<Instant>,
}

/// Auth rate limiter keyed on `(host, user)`.
pub struct AuthRateLimiter {
    inner: Mutex<Inner>,
}

struct Inner {
    policy: RateLimitPolicy,
    entries: HashMap<(String, String), FailureState>,
}

impl AuthRateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner {
                policy,
                entries: HashMap::new(),
            }),
        }
    }

    /// Refuse the attempt if the key is currently locked out.
    pub fn check(&self, host: &str, user: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("rate limiter poisoned");
        let key = (host.to_string(), user.to_string());
        if let Some(state) = inner.entries.get_mut(&key) {
            if let Some(until) = state.locked_until {
                let now = Instant::now();
                if now < until {
                    let remaining = (until - now).as_secs();
                    return Err(Error::AuthFailed(format!(
                        "{user}@{host} is locked out after repeated auth failures \
                         ({remaining}s remaining)"
                    )));
                }
                // Lockout elapsed — start a fresh window.
                state.locked_until = None;
                state.count = 0;
                state.window_start = now;
            }
        }
        Ok(())
    }

    /// Record a failed auth attempt; may trip the lockout.
    pub fn record_failure(&self, host: &str, user: &str) {
        let mut inner = self.inner.lock().expect("rate limiter poisoned");
        let policy = inner.policy;
        let now = Instant::now();
        let state = inner
            .entries
            .entry((host.to_string(), user.to_string()))
            .or_insert(FailureState {
                count: 0,
                window_start: now,
                locked_until: None,
            });
        if now.duration_since(state.window_start) > policy.window {
            state.count = 0;
            state.window_start = now;
        }
        state.count += 1;
        if state.count >= policy.max_failures {
            state.locked_until = Some(now + policy.lockout);
        }
    }

    /// A successful auth clears the failure counter for the key.
    pub fn record_success(&self, host: &str, user: &str) {
        let mut inner = self.inner.lock().expect("rate limiter poisoned");
        inner
            .entries
            .remove(&(host.to_string(), user.to_string()));
    }

    /// Replace the policy (config hot-reload). Existing counters keep
    /// counting under the new thresholds; active lockouts are preserved.
    pub fn set_policy(&self, policy: RateLimitPolicy) {
        self.inner.lock().expect("rate limiter poisoned").policy = policy;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_policy() -> RateLimitPolicy {
        RateLimitPolicy {
            max_failures: 3,
            window: Duration::from_secs(60),
            lockout: Duration::from_secs(60),
        }
    }

    #[test]
    fn locks_after_max_failures() {
        let rl = AuthRateLimiter::new(quick_policy());
        for _ in 0..3 {
            assert!(rl.check("h", "u").is_ok());
            rl.record_failure("h", "u");
        }
        let err = rl.check("h", "u").unwrap_err();
        assert!(err.to_string().contains("locked"));
    }

    #[test]
    fn success_resets_counter() {
        let rl = AuthRateLimiter::new(quick_policy());
        rl.record_failure("h", "u");
        rl.record_failure("h", "u");
        rl.record_success("h", "u");
        for _ in 0..2 {
            rl.record_failure("h", "u");
        }
        // Only 2 failures since the reset — not locked yet.
        assert!(rl.check("h", "u").is_ok());
    }

    #[test]
    fn keys_are_independent() {
        let rl = AuthRateLimiter::new(quick_policy());
        for _ in 0..3 {
            rl.record_failure("h1", "u");
        }
        assert!(rl.check("h1", "u").is_err());
        assert!(rl.check("h2", "u").is_ok());
        assert!(rl.check("h1", "other").is_ok());
    }

    #[test]
    fn lockout_expires() {
        let rl = AuthRateLimiter::new(RateLimitPolicy {
            max_failures: 1,
            window: Duration::from_secs(60),
            lockout: Duration::from_millis(10),
        });
        rl.record_failure("h", "u");
        assert!(rl.check("h", "u").is_err());
        std::thread::sleep(Duration::from_millis(20));
        assert!(rl.check("h", "u").is_ok());
    }
}
