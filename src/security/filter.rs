//! Allow/deny regex filter over command lines.
//!
//! A command is allowed iff it matches no deny pattern AND either the allow
//! list is empty or it matches at least one allow pattern. Deny always wins.
//!
//! Invalid user-supplied patterns must never abort startup: when compilation
//! fails at boot the filter reverts to permissive (and the failure is
//! logged). On hot-reload a failed compile keeps the previous filter instead.

use regex::Regex;
use tracing::warn;

/// Compiled command filter.
#[derive(Debug)]
pub struct CommandFilter {
    deny: Vec<Regex>,
    allow: Vec<Regex>,
}

/// Outcome of filtering a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    /// Contains the pattern that matched (deny) or a description (allowlist miss).
    Blocked(String),
}

impl CommandFilter {
    /// Compile deny and allow pattern lists. Fails on the first invalid
    /// pattern so callers can decide between permissive fallback (boot) and
    /// keeping the previous filter (reload).
    pub fn compile(deny: &[String], allow: &[String]) -> Result<Self, regex::Error> {
        let deny = deny
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        let allow = allow
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { deny, allow })
    }

    /// Compile, falling back to a permissive filter on invalid patterns.
    /// Used at boot so user-supplied patterns can never prevent startup.
    pub fn compile_or_permissive(deny: &[String], allow: &[String]) -> Self {
        match Self::compile(deny, allow) {
            Ok(f) => f,
            Err(e) => {
                warn!("invalid command filter pattern ({e}), filter is permissive");
                Self::permissive()
            }
        }
    }

    /// A filter that allows everything.
    pub fn permissive() -> Self {
        Self {
            deny: Vec::new(),
            allow: Vec::new(),
        }
    }

    /// Evaluate a command line. Deny takes precedence over allow.
    pub fn evaluate(&self, command: &str) -> Verdict {
        for pat in &self.deny {
            if pat.is_match(command) {
                return Verdict::Blocked(format!("blocked by pattern `{}`", pat.as_str()));
            }
        }
        if !self.allow.is_empty() && !self.allow.iter().any(|p| p.is_match(command)) {
            return Verdict::Blocked("blocked: command matches no allowlist pattern".to_string());
        }
        Verdict::Allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_allows() {
        let f = CommandFilter::permissive();
        assert_eq!(f.evaluate("anything at all"), Verdict::Allowed);
    }

    #[test]
    fn deny_blocks() {
        let f = CommandFilter::compile(&["rm -rf /".to_string()], &[]).unwrap();
        assert!(matches!(f.evaluate("rm -rf /"), Verdict::Blocked(_)));
        assert_eq!(f.evaluate("ls -la"), Verdict::Allowed);
    }

    #[test]
    fn deny_wins_over_allow() {
        let f = CommandFilter::compile(
            &["^sudo".to_string()],
            &["^sudo apt".to_string()],
        )
        .unwrap();
        assert!(matches!(f.evaluate("sudo apt update"), Verdict::Blocked(_)));
    }

    #[test]
    fn allowlist_restricts() {
        let f = CommandFilter::compile(&[], &["^git ".to_string(), "^ls".to_string()]).unwrap();
        assert_eq!(f.evaluate("git status"), Verdict::Allowed);
        assert_eq!(f.evaluate("ls -la"), Verdict::Allowed);
        assert!(matches!(f.evaluate("cat /etc/passwd"), Verdict::Blocked(_)));
    }

    #[test]
    fn invalid_pattern_falls_back_permissive() {
        let f = CommandFilter::compile_or_permissive(&["(unclosed".to_string()], &[]);
        assert_eq!(f.evaluate("rm -rf /"), Verdict::Allowed);
    }

    #[test]
    fn blocked_message_mentions_blocked() {
        let f = CommandFilter::compile(&["rm -rf /".to_string()], &[]).unwrap();
        match f.evaluate("rm -rf /") {
            Verdict::Blocked(msg) => assert!(msg.contains("blocked")),
            Verdict::Allowed => panic!("expected block"),
        }
    }
}
