//! Shared helpers: home-directory expansion, slash-joined paths, epoch
//! clock reads.

use std::time::{SystemTime, UNIX_EPOCH};

/// Replace a leading `~` with `$HOME`. Only a bare `~` or a `~/` prefix is
/// expanded; a tilde anywhere else (or an unset `$HOME`) leaves the path
/// untouched.
pub fn expand_tilde(path: &str) -> String {
    let Ok(home) = std::env::var("HOME") else {
        return path.to_string();
    };
    match path.strip_prefix('~') {
        Some("") => home,
        Some(rest) if rest.starts_with('/') => home + rest,
        _ => path.to_string(),
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Nanoseconds since the Unix epoch (used for overflow file names).
pub fn now_ns() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos())
}

/// Join a destination directory and a relative path with `/` separators.
///
/// Walked paths may contain `\` on exotic hosts; they are normalized before
/// concatenation so destination paths are always slash-separated.
pub fn join_slash(dir: &str, rel: &str) -> String {
    let rel = rel.replace('\\', "/");
    let dir = dir.trim_end_matches('/');
    if rel.is_empty() {
        dir.to_string()
    } else {
        format!("{dir}/{rel}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tilde_bare() {
        std::env::set_var("HOME", "/home/test");
        assert_eq!(expand_tilde("~"), "/home/test");
    }

    #[test]
    fn tilde_prefix() {
        std::env::set_var("HOME", "/home/test");
        assert_eq!(expand_tilde("~/x/y"), "/home/test/x/y");
    }

    #[test]
    fn tilde_passthrough() {
        assert_eq!(expand_tilde("/abs/path"), "/abs/path");
        assert_eq!(expand_tilde("rel/~notexpanded"), "rel/~notexpanded");
    }

    #[test]
    fn join_slash_normalizes_backslashes() {
        assert_eq!(join_slash("/dst/", "a\\b/c.txt"), "/dst/a/b/c.txt");
    }

    #[test]
    fn join_slash_empty_rel() {
        assert_eq!(join_slash("/dst", ""), "/dst");
    }
}
