use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main application configuration structure.
/// Matches the layout of `votebot.yaml`; every field has a default so the
/// file itself is optional.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_database")]
    pub database: PathBuf,
    /// Base URL of a remote manager service. When set, administrative
    /// commands are forwarded there instead of touching local storage.
    #[serde(default)]
    pub manager_url: Option<String>,
    /// Default log filter when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory the daemon writes its log file into.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

fn default_database() -> PathBuf {
    PathBuf::from("votebot.sqlite3")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            manager_url: None,
            log_level: default_log_level(),
            log_dir: default_log_dir(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a YAML file. A missing file yields the
    /// defaults; a file that exists but fails to parse is an error.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }
}
