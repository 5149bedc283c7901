//! # pkgfs-config
//!
//! Configuration management for pkgfs.
//!
//! Loads configuration from:
//! 1. `~/.pkgfs/config.toml` (global)
//! 2. `.pkgfs/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)

pub mod load;
pub mod logging;
pub mod testing;

pub use load::{LoadConfig, LoadRule, OpenType};
pub use logging::{init_logging, LogLevel};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::debug;

/// Default storage root when nothing else is configured.
pub const DEFAULT_STORAGE_ROOT: &str = "~/.pkgfs/data";

/// Default per-physical-file size threshold for package data files (1 GiB).
pub const DEFAULT_PACKAGE_DATA_FILE_SIZE: u64 = 1024 * 1024 * 1024;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get global config (read-only snapshot)
pub fn config() -> Config {
    match CONFIG.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    match CONFIG.write() {
        Ok(mut guard) => *guard = new_config,
        Err(poisoned) => *poisoned.into_inner() = new_config,
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid load rule pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("unknown open type: {0}")]
    UnknownOpenType(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub load: LoadConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                config = Self::load_file(&global_path)?;
            }
        }

        let project_path = Self::project_config_path();
        if project_path.exists() {
            debug!("Loading project config from {:?}", project_path);
            let project_config = Self::load_file(&project_path)?;
            config.merge(project_config);
        }

        config.apply_env_overrides();
        config.load.compile()?;

        Ok(config)
    }

    /// Parse a single config file without merging or env overrides.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Global config path: ~/.pkgfs/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".pkgfs/config.toml"))
    }

    /// Project config path: .pkgfs/config.toml
    pub fn project_config_path() -> PathBuf {
        PathBuf::from(".pkgfs/config.toml")
    }

    /// Merge another config (project overrides)
    pub fn merge(&mut self, other: Config) {
        let defaults = Config::default();
        if other.storage.root != defaults.storage.root {
            self.storage.root = other.storage.root;
        }
        if other.storage.package_data_file_size != defaults.storage.package_data_file_size {
            self.storage.package_data_file_size = other.storage.package_data_file_size;
        }
        if other.load.default_open_type != defaults.load.default_open_type {
            self.load.default_open_type = other.load.default_open_type;
        }
        if !other.load.rules.is_empty() {
            self.load.rules = other.load.rules;
        }
        if other.logging.level != defaults.logging.level {
            self.logging.level = other.logging.level;
        }
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("PKGFS_ROOT") {
            self.storage.root = PathBuf::from(path);
        }
        if let Ok(size) = std::env::var("PKGFS_PACKAGE_DATA_FILE_SIZE") {
            if let Ok(n) = size.parse() {
                self.storage.package_data_file_size = n;
            }
        }
        if let Ok(open_type) = std::env::var("PKGFS_OPEN_TYPE") {
            if let Ok(t) = open_type.parse() {
                self.load.default_open_type = t;
            }
        }
    }

    /// Storage root with `~/` expanded.
    pub fn storage_root(&self) -> PathBuf {
        expand_home(&self.storage.root)
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(stripped) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory of the disk tier
    pub root: PathBuf,
    /// Size threshold after which a package starts a new data file (0 = unlimited)
    pub package_data_file_size: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_STORAGE_ROOT),
            package_data_file_size: DEFAULT_PACKAGE_DATA_FILE_SIZE,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// One of error, warn, info, debug, trace
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn log_level(&self) -> LogLevel {
        match self.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Warn,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.storage.root, PathBuf::from(DEFAULT_STORAGE_ROOT));
        assert_eq!(
            config.storage.package_data_file_size,
            DEFAULT_PACKAGE_DATA_FILE_SIZE
        );
        assert_eq!(config.load.default_open_type, OpenType::Mmap);
        assert!(config.load.rules.is_empty());
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(toml_str.contains("[storage]"));
        assert!(toml_str.contains("[load]"));
        assert!(toml_str.contains("package_data_file_size"));
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = Config::default();
        config.load.rules.push(LoadRule::new(".*/attribute/.*", OpenType::Cache));
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.load.rules.len(), 1);
        assert_eq!(parsed.load.rules[0].open_type, OpenType::Cache);
    }

    #[test]
    fn test_merge_keeps_unset_sections() {
        let mut base = Config::default();
        base.storage.package_data_file_size = 4096;

        let mut project = Config::default();
        project.load.default_open_type = OpenType::Buffered;
        base.merge(project);

        assert_eq!(base.storage.package_data_file_size, 4096);
        assert_eq!(base.load.default_open_type, OpenType::Buffered);
    }

    #[test]
    fn test_log_level_parsing() {
        let logging = LoggingConfig {
            level: "DEBUG".to_string(),
        };
        assert_eq!(logging.log_level(), LogLevel::Debug);
        let logging = LoggingConfig {
            level: "nonsense".to_string(),
        };
        assert_eq!(logging.log_level(), LogLevel::Warn);
    }
}
