use chrono::Utc;
use std::path::{Path, PathBuf};

pub const SECONDS_PER_DAY: f64 = 86_400.0;

/// Current wall-clock time as fractional seconds since the unix epoch.
pub fn epoch_now() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1_000.0
}

pub fn getshorthostname() -> String {
    gethostname::gethostname()
        .to_string_lossy()
        .split('.')
        .next()
        .unwrap_or_default()
        .to_string()
}

pub fn current_user() -> Option<String> {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .ok()
        .filter(|u| !u.is_empty())
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix('~'), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest.trim_start_matches('/')),
        _ => PathBuf::from(path),
    }
}

/// True if `a` and `b` are distinct paths and one contains the other.
pub fn is_parent_or_child(a: &str, b: &str) -> bool {
    let (a, b) = (Path::new(a), Path::new(b));
    a != b && (a.starts_with(b) || b.starts_with(a))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_child_is_component_wise() {
        assert!(is_parent_or_child("/home/me", "/home/me/src"));
        assert!(is_parent_or_child("/home/me/src", "/home/me"));
        assert!(!is_parent_or_child("/home/me", "/home/me"));
        assert!(!is_parent_or_child("/home/me", "/home/meow"));
    }

    #[test]
    fn expand_home_leaves_absolute_paths() {
        assert_eq!(expand_home("/etc/ssh"), PathBuf::from("/etc/ssh"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/.ssh"), home.join(".ssh"));
        }
    }
}
