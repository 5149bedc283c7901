//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - Temporary storage roots
//! - Isolated config files
//!
//! # Usage
//!
//! ```ignore
//! use pkgfs_config::testing::TestEnvironment;
//!
//! #[test]
//! fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     // env.storage_root and env.config_path are isolated per test
//! }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::Config;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Disk tier root for this test
    pub storage_root: PathBuf,
    /// Scratch directory outside the storage root (e.g. sources to pack)
    pub scratch_root: PathBuf,
    /// Isolated config file location
    pub config_path: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let storage_root = root.join("storage");
        let scratch_root = root.join("scratch");
        let config_dir = root.join(".pkgfs");

        std::fs::create_dir_all(&storage_root)?;
        std::fs::create_dir_all(&scratch_root)?;
        std::fs::create_dir_all(&config_dir)?;

        Ok(Self {
            _temp_dir: temp_dir,
            storage_root,
            scratch_root,
            config_path: config_dir.join("config.toml"),
            test_id,
        })
    }

    /// Create a file under the scratch root
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.scratch_root.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Create a directory under the scratch root
    pub fn create_dir(&self, relative_path: &str) -> anyhow::Result<PathBuf> {
        let path = self.scratch_root.join(relative_path);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Config pointing at this environment's storage root
    pub fn config(&self) -> Config {
        let mut cfg = Config::default();
        cfg.storage.root = self.storage_root.clone();
        cfg
    }

    /// Write `config()` (or a caller-provided one) to `config_path`
    pub fn write_config(&self, config: &Config) -> anyhow::Result<PathBuf> {
        std::fs::write(&self.config_path, toml::to_string_pretty(config)?)?;
        Ok(self.config_path.clone())
    }

    /// Environment variables for spawning the CLI against this environment
    pub fn env_vars(&self) -> Vec<(String, String)> {
        vec![(
            "PKGFS_ROOT".to_string(),
            self.storage_root.to_string_lossy().into_owned(),
        )]
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}
