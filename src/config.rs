//! Configuration file support for repocache
//!
//! Reads `config.toml` from the data directory. Missing files and missing
//! keys fall back to defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment override for the data directory
pub const DATA_DIR_ENV: &str = "REPOCACHE_DATA_DIR";

/// Configuration structure
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct Config {
    /// Where the database lives. Default: per-user data directory
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub watcher: WatcherConfig,
}

/// Cache retention bounds
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RetentionConfig {
    /// Days since last access before a cache row is pruned
    /// Default: 30
    #[serde(default = "default_ttl_days")]
    pub ttl_days: u32,

    /// Total repo + patch cache size cap in megabytes
    /// Default: 500
    #[serde(default = "default_max_cache_mb")]
    pub max_cache_mb: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct WatcherConfig {
    /// Quiet period before a burst of filesystem events is reported
    /// Default: 300
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_ttl_days() -> u32 {
    30
}

fn default_max_cache_mb() -> u64 {
    500
}

fn default_debounce_ms() -> u64 {
    300
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            ttl_days: default_ttl_days(),
            max_cache_mb: default_max_cache_mb(),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self { debounce_ms: default_debounce_ms() }
    }
}

impl WatcherConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Config {
    /// Load `config.toml` from the default data directory.
    /// Returns default config if the file doesn't exist or doesn't parse.
    pub fn load() -> Self {
        let dir = default_data_dir();
        let mut config = Self::load_from(&dir.join("config.toml"));
        if config.data_dir.is_none() {
            config.data_dir = Some(dir);
        }
        config
    }

    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                log::warn!("ignoring invalid {}: {}", path.display(), e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Resolved data directory: env var, then config, then per-user default
    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = std::env::var_os(DATA_DIR_ENV) {
            return PathBuf::from(dir);
        }
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }
}

/// `$REPOCACHE_DATA_DIR`, else `<user data dir>/repocache`
pub fn default_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_default().join(".local/share"))
        .join("repocache")
}
