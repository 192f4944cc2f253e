//! Runtime configuration.
//!
//! Read from `$SHELLCUE_CONFIG` or `~/.shellcue/config.toml`. A missing file
//! means defaults; every section and field is optional.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_ENV: &str = "SHELLCUE_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub suggestions: SuggestionsConfig,
    pub database: DatabaseConfig,
    pub privacy: PrivacyConfig,
    pub daemon: DaemonConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SuggestionsConfig {
    pub enabled: bool,
    pub max_suggestions: usize,
    pub min_confidence: f64,
    /// Pass suggest results through the multi-factor ranker.
    pub rerank: bool,
}

impl Default for SuggestionsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_suggestions: 5,
            min_confidence: 0.1,
            rerank: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    /// History older than this is dropped at startup. Zero keeps everything.
    pub retention_days: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: state_dir().join("history.db"),
            retention_days: 90,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PrivacyConfig {
    pub excluded_paths: Vec<String>,
    pub excluded_patterns: Vec<String>,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            excluded_paths: vec!["~/.ssh".to_string(), "~/.gnupg".to_string()],
            excluded_patterns: vec![
                r"(?i)password=".to_string(),
                r"(?i)passwd\s".to_string(),
                r"(?i)(api[_-]?key|secret|token)=".to_string(),
                r"(?i)authorization:\s*bearer".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub pid_path: PathBuf,
    pub index_path: PathBuf,
    pub accept_timeout_ms: u64,
    /// How many recent successful commands feed a retrain.
    pub retrain_sample: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let dir = state_dir();
        Self {
            socket_path: dir.join("daemon.sock"),
            pid_path: dir.join("daemon.pid"),
            index_path: dir.join("index.bin"),
            accept_timeout_ms: 250,
            retrain_sample: 5_000,
        }
    }
}

/// `~/.shellcue`, falling back to the temp dir when there is no home.
pub fn state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".shellcue")
}

pub fn default_config_path() -> PathBuf {
    match std::env::var_os(CONFIG_ENV) {
        Some(path) => PathBuf::from(path),
        None => state_dir().join("config.toml"),
    }
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => default_config_path(),
        };

        if !config_path.exists() {
            tracing::debug!(path = %config_path.display(), "No config file; using defaults");
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config {}", config_path.display()))?;
        let config = toml::from_str::<Config>(&content)
            .with_context(|| format!("Failed to parse config {}", config_path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Every file the daemon owns lives under `dir`. Used for tests and
    /// throwaway instances.
    pub fn rooted_at(dir: &Path) -> Config {
        Config {
            database: DatabaseConfig {
                path: dir.join("history.db"),
                ..DatabaseConfig::default()
            },
            daemon: DaemonConfig {
                socket_path: dir.join("daemon.sock"),
                pid_path: dir.join("daemon.pid"),
                index_path: dir.join("index.bin"),
                ..DaemonConfig::default()
            },
            ..Config::default()
        }
    }

    fn validate(&self) -> Result<()> {
        let min = self.suggestions.min_confidence;
        if !(0.0..=1.0).contains(&min) {
            anyhow::bail!("suggestions.min_confidence must be within [0, 1], got {}", min);
        }
        if self.suggestions.max_suggestions == 0 {
            anyhow::bail!("suggestions.max_suggestions must be at least 1");
        }
        Ok(())
    }
}
