use anyhow::{Context, Result};
use regex::Regex;
use std::path::{Path, PathBuf};

use crate::config::PrivacyConfig;
use crate::util::expand_home;

/// Decides whether a command may be persisted at all.
pub trait PrivacyFilter: Send + Sync {
    fn should_filter(&self, command: &str, cwd: &str) -> bool;
}

/// Filters commands run inside excluded directories or matching any
/// excluded pattern.
#[derive(Debug)]
pub struct PatternFilter {
    excluded_paths: Vec<PathBuf>,
    excluded_patterns: Vec<Regex>,
}

impl PatternFilter {
    pub fn from_config(config: &PrivacyConfig) -> Result<Self> {
        let excluded_patterns = config
            .excluded_patterns
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("Invalid privacy pattern {:?}", p)))
            .collect::<Result<Vec<_>>>()?;
        Ok(PatternFilter {
            excluded_paths: config.excluded_paths.iter().map(|p| expand_home(p)).collect(),
            excluded_patterns,
        })
    }
}

impl PrivacyFilter for PatternFilter {
    fn should_filter(&self, command: &str, cwd: &str) -> bool {
        let cwd = Path::new(cwd);
        self.excluded_paths.iter().any(|p| cwd.starts_with(p))
            || self.excluded_patterns.iter().any(|re| re.is_match(command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(paths: &[&str], patterns: &[&str]) -> PatternFilter {
        PatternFilter::from_config(&PrivacyConfig {
            excluded_paths: paths.iter().map(|s| s.to_string()).collect(),
            excluded_patterns: patterns.iter().map(|s| s.to_string()).collect(),
        })
        .unwrap()
    }

    #[test]
    fn default_patterns_catch_credentials() {
        let f = PatternFilter::from_config(&PrivacyConfig::default()).unwrap();
        assert!(f.should_filter("mysql -u root --password=hunter2", "/tmp"));
        assert!(f.should_filter("export API_KEY=abc", "/tmp"));
        assert!(!f.should_filter("git status", "/tmp"));
    }

    #[test]
    fn excluded_paths_cover_subdirectories() {
        let f = filter(&["/secret"], &[]);
        assert!(f.should_filter("ls", "/secret"));
        assert!(f.should_filter("ls", "/secret/keys"));
        assert!(!f.should_filter("ls", "/secretive"));
    }

    #[test]
    fn invalid_pattern_is_an_error() {
        let config = PrivacyConfig {
            excluded_paths: vec![],
            excluded_patterns: vec!["(unclosed".to_string()],
        };
        assert!(PatternFilter::from_config(&config).is_err());
    }
}
