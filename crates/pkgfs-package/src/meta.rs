//! Package meta: the index of a package's inner files.

use serde::{Deserialize, Serialize};

use pkgfs_config::log_package_debug;
use pkgfs_storage::{path, StorageBackend};

use crate::naming::{package_file_meta_path, DATA_SUFFIX};
use crate::{PackageError, Result};

/// Current meta format version
const META_VERSION: u32 = 1;

/// One inner file or directory of a package.
///
/// `path` is relative to the directory holding the package. Directories
/// carry zero offset and length.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InnerFileMeta {
    pub path: String,
    pub is_dir: bool,
    pub offset: u64,
    pub length: u64,
    pub physical_file_index: usize,
}

impl InnerFileMeta {
    /// File entry at `[offset, offset + length)` of data file `physical_file_index`.
    pub fn file(path: impl Into<String>, offset: u64, length: u64, physical_file_index: usize) -> Self {
        Self {
            path: path.into(),
            is_dir: false,
            offset,
            length,
            physical_file_index,
        }
    }

    /// Directory entry.
    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            is_dir: true,
            offset: 0,
            length: 0,
            physical_file_index: 0,
        }
    }
}

/// A physical data file produced for a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalFileEntry {
    /// File name relative to the package's directory (`<name>.__data__0`).
    pub name: String,
    pub length: u64,
}

/// Summary counts of a package.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackageStats {
    pub file_count: usize,
    pub dir_count: usize,
    pub payload_bytes: u64,
    pub physical_file_count: usize,
}

/// Meta of one package: inner entries plus the data files backing them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageFileMeta {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub data_tag: String,
    #[serde(default)]
    pub physical_files: Vec<PhysicalFileEntry>,
    #[serde(default)]
    pub inner_files: Vec<InnerFileMeta>,
}

fn default_version() -> u32 {
    META_VERSION
}

impl PackageFileMeta {
    /// Create an empty meta for data files tagged with `data_tag`.
    pub fn new(data_tag: impl Into<String>) -> Self {
        Self {
            version: META_VERSION,
            data_tag: data_tag.into(),
            physical_files: Vec::new(),
            inner_files: Vec::new(),
        }
    }

    pub fn add_inner_file(&mut self, meta: InnerFileMeta) {
        self.inner_files.push(meta);
    }

    pub fn add_physical_file(&mut self, name: impl Into<String>, length: u64) {
        self.physical_files.push(PhysicalFileEntry {
            name: name.into(),
            length,
        });
    }

    pub fn inner_files(&self) -> &[InnerFileMeta] {
        &self.inner_files
    }

    /// Data file names in index order.
    pub fn physical_file_names(&self) -> Vec<String> {
        self.physical_files.iter().map(|p| p.name.clone()).collect()
    }

    pub fn physical_file_length(&self, idx: usize) -> Option<u64> {
        self.physical_files.get(idx).map(|p| p.length)
    }

    /// Virtual path of data file `idx` for the package at `package_path`.
    pub fn physical_file_path(&self, package_path: &str, idx: usize) -> Option<String> {
        let entry = self.physical_files.get(idx)?;
        let dir = path::parent(package_path).unwrap_or_else(|| "/".to_string());
        Some(path::join(&dir, &entry.name))
    }

    /// Absolute virtual path of an inner entry of the package at `package_path`.
    pub fn inner_file_path(package_path: &str, inner: &InnerFileMeta) -> String {
        let dir = path::parent(package_path).unwrap_or_else(|| "/".to_string());
        path::join(&dir, &inner.path)
    }

    pub fn stats(&self) -> PackageStats {
        let mut stats = PackageStats {
            physical_file_count: self.physical_files.len(),
            ..Default::default()
        };
        for inner in &self.inner_files {
            if inner.is_dir {
                stats.dir_count += 1;
            } else {
                stats.file_count += 1;
                stats.payload_bytes += inner.length;
            }
        }
        stats
    }

    /// Check that every entry is well formed and fits in its data file.
    pub fn validate(&self) -> Result<()> {
        if self.version > META_VERSION {
            return Err(PackageError::Invalid(format!(
                "Unsupported meta version: {}",
                self.version
            )));
        }
        for entry in &self.physical_files {
            if entry.name.is_empty() || entry.name.contains('/') || !entry.name.contains(DATA_SUFFIX) {
                return Err(PackageError::Invalid(format!(
                    "Bad data file name: {:?}",
                    entry.name
                )));
            }
        }
        for inner in &self.inner_files {
            let normalized = path::normalize(&inner.path);
            if normalized == "/" || normalized.trim_start_matches('/') != inner.path {
                return Err(PackageError::Invalid(format!(
                    "Inner path must be relative and normalized: {:?}",
                    inner.path
                )));
            }
            if inner.is_dir {
                continue;
            }
            let Some(file_len) = self.physical_file_length(inner.physical_file_index) else {
                return Err(PackageError::Invalid(format!(
                    "{} points into data file {} of {}",
                    inner.path,
                    inner.physical_file_index,
                    self.physical_files.len()
                )));
            };
            let end = inner.offset.checked_add(inner.length);
            if end.map_or(true, |end| end > file_len) {
                return Err(PackageError::Invalid(format!(
                    "{} range [{}, +{}) exceeds data file length {}",
                    inner.path, inner.offset, inner.length, file_len
                )));
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse and validate a meta from its JSON form.
    pub fn from_json(json: &str) -> Result<Self> {
        let meta: Self = serde_json::from_str(json)?;
        meta.validate()?;
        Ok(meta)
    }

    /// Load the meta of `package_path` from `storage`.
    ///
    /// Returns `Ok(None)` when the meta file does not exist.
    pub fn load(storage: &dyn StorageBackend, package_path: &str) -> Result<Option<Self>> {
        let meta_path = package_file_meta_path(package_path);
        let bytes = match storage.atomic_load(&meta_path) {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let json = String::from_utf8(bytes)
            .map_err(|e| PackageError::Invalid(format!("{}: {}", meta_path, e)))?;
        let meta = Self::from_json(&json)?;
        log_package_debug!(
            "Loaded package meta",
            package = package_path,
            entries = meta.inner_files.len(),
            data_files = meta.physical_files.len()
        );
        Ok(Some(meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkgfs_storage::MemStorage;

    fn sample() -> PackageFileMeta {
        let mut meta = PackageFileMeta::new("");
        meta.add_physical_file("package_file.__data__0", 9);
        meta.add_inner_file(InnerFileMeta::directory("index"));
        meta.add_inner_file(InnerFileMeta::file("file1", 0, 4, 0));
        meta.add_inner_file(InnerFileMeta::file("index/file2", 4, 5, 0));
        meta
    }

    #[test]
    fn test_json_roundtrip() {
        let meta = sample();
        let json = meta.to_json().unwrap();
        let parsed = PackageFileMeta::from_json(&json).unwrap();
        assert_eq!(parsed, meta);
        assert_eq!(parsed.physical_file_names(), vec!["package_file.__data__0"]);
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        assert!(matches!(
            PackageFileMeta::from_json("{not json"),
            Err(PackageError::Parse(_))
        ));
    }

    #[test]
    fn test_range_past_data_file_is_invalid() {
        let mut meta = sample();
        meta.add_inner_file(InnerFileMeta::file("file3", 8, 2, 0));
        assert!(matches!(meta.validate(), Err(PackageError::Invalid(_))));
    }

    #[test]
    fn test_missing_data_file_is_invalid() {
        let mut meta = sample();
        meta.add_inner_file(InnerFileMeta::file("file3", 0, 0, 1));
        assert!(matches!(meta.validate(), Err(PackageError::Invalid(_))));
    }

    #[test]
    fn test_absolute_inner_path_is_invalid() {
        let mut meta = sample();
        meta.add_inner_file(InnerFileMeta::directory("/abs"));
        assert!(matches!(meta.validate(), Err(PackageError::Invalid(_))));
    }

    #[test]
    fn test_paths_resolve_against_package_dir() {
        let meta = sample();
        assert_eq!(
            meta.physical_file_path("/seg/package_file", 0).unwrap(),
            "/seg/package_file.__data__0"
        );
        assert_eq!(meta.physical_file_path("/seg/package_file", 1), None);
        assert_eq!(
            PackageFileMeta::inner_file_path("/seg/package_file", &meta.inner_files()[2]),
            "/seg/index/file2"
        );
        assert_eq!(
            PackageFileMeta::inner_file_path("/package_file", &meta.inner_files()[1]),
            "/file1"
        );
    }

    #[test]
    fn test_stats() {
        let stats = sample().stats();
        assert_eq!(stats.file_count, 2);
        assert_eq!(stats.dir_count, 1);
        assert_eq!(stats.payload_bytes, 9);
        assert_eq!(stats.physical_file_count, 1);
    }

    #[test]
    fn test_load_missing_is_none() {
        let mem = MemStorage::new();
        assert!(PackageFileMeta::load(&mem, "/seg/package_file").unwrap().is_none());

        mem.store(
            "/seg/package_file.__meta__",
            sample().to_json().unwrap().as_bytes(),
        )
        .unwrap();
        let loaded = PackageFileMeta::load(&mem, "/seg/package_file").unwrap();
        assert_eq!(loaded, Some(sample()));
    }
}
