//! Disk-backed storage rooted at a host directory.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::instrument;
use walkdir::WalkDir;

use crate::path::normalize;
use crate::{checked_range_end, Result, StorageBackend, StorageError};

/// Suffix of in-flight temp files; hidden from listings.
const TEMP_SUFFIX: &str = ".pkgfs-tmp";

/// Storage backend mapping virtual paths onto a host directory.
///
/// `/seg_0/index/file` lives at `<root>/seg_0/index/file`.
#[derive(Debug, Clone)]
pub struct DiskStorage {
    root: PathBuf,
}

impl DiskStorage {
    /// Create a disk storage at the given root directory.
    ///
    /// The directory will be created if it doesn't exist.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Get the root path of the storage.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Host path for a virtual path.
    fn host_path(&self, path: &str) -> PathBuf {
        let normalized = normalize(path);
        let relative = normalized.trim_start_matches('/');
        if relative.is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }

    /// Unique sibling temp file for `target`.
    ///
    /// Uses pid + thread id so parallel writers never share a temp file.
    fn temp_path(target: &Path) -> PathBuf {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_name = format!(
            ".{}.{}.{:?}{}",
            name,
            std::process::id(),
            std::thread::current().id(),
            TEMP_SUFFIX
        );
        target.with_file_name(temp_name)
    }

    fn write_temp(target: &Path, data: &[u8]) -> Result<PathBuf> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp_path = Self::temp_path(target);
        let mut file = File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        Ok(temp_path)
    }
}

fn map_io(e: io::Error, path: &str) -> StorageError {
    match e.kind() {
        io::ErrorKind::NotFound => StorageError::NotFound(path.to_string()),
        io::ErrorKind::AlreadyExists => StorageError::AlreadyExists(path.to_string()),
        _ => StorageError::Io(e),
    }
}

impl StorageBackend for DiskStorage {
    fn exists(&self, path: &str) -> bool {
        self.host_path(path).exists()
    }

    fn is_dir(&self, path: &str) -> bool {
        self.host_path(path).is_dir()
    }

    fn mkdir(&self, path: &str, recursive: bool) -> Result<()> {
        let host = self.host_path(path);
        if host.is_dir() {
            return Ok(());
        }
        if host.exists() {
            return Err(StorageError::NotADirectory(path.to_string()));
        }
        let result = if recursive {
            fs::create_dir_all(&host)
        } else {
            fs::create_dir(&host)
        };
        result.map_err(|e| map_io(e, path))
    }

    #[instrument(skip(self, data), fields(len = data.len()), level = "debug")]
    fn store(&self, path: &str, data: &[u8]) -> Result<()> {
        let target = self.host_path(path);
        if target.is_dir() {
            return Err(StorageError::IsADirectory(path.to_string()));
        }
        let temp_path = Self::write_temp(&target, data)?;
        if let Err(e) = fs::rename(&temp_path, &target) {
            let _ = fs::remove_file(&temp_path);
            return Err(map_io(e, path));
        }
        Ok(())
    }

    #[instrument(skip(self, data), fields(len = data.len()), level = "debug")]
    fn atomic_store(&self, path: &str, data: &[u8]) -> Result<()> {
        let target = self.host_path(path);
        if target.exists() {
            return Err(StorageError::AlreadyExists(path.to_string()));
        }
        let temp_path = Self::write_temp(&target, data)?;

        // hard_link refuses to replace an existing target, which makes the
        // existence check and the promotion a single step.
        let promoted = match fs::hard_link(&temp_path, &target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(StorageError::AlreadyExists(path.to_string()))
            }
            Err(_) if target.exists() => Err(StorageError::AlreadyExists(path.to_string())),
            // Filesystems without hard links: fall back to rename
            Err(_) => fs::rename(&temp_path, &target).map_err(|e| map_io(e, path)),
        };
        let _ = fs::remove_file(&temp_path);
        promoted
    }

    #[instrument(skip(self), level = "debug")]
    fn atomic_load(&self, path: &str) -> Result<Vec<u8>> {
        let host = self.host_path(path);
        if host.is_dir() {
            return Err(StorageError::IsADirectory(path.to_string()));
        }
        fs::read(&host).map_err(|e| map_io(e, path))
    }

    fn read_range(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut file = File::open(self.host_path(path)).map_err(|e| map_io(e, path))?;
        let file_len = file.metadata()?.len();
        checked_range_end(path, offset, len, file_len)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let src = self.host_path(from);
        let dst = self.host_path(to);
        if !src.exists() {
            return Err(StorageError::NotFound(from.to_string()));
        }
        if dst.exists() {
            return Err(StorageError::AlreadyExists(to.to_string()));
        }
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&src, &dst).map_err(|e| map_io(e, from))
    }

    fn get_length(&self, path: &str) -> Result<u64> {
        let meta = fs::metadata(self.host_path(path)).map_err(|e| map_io(e, path))?;
        if meta.is_dir() {
            return Err(StorageError::IsADirectory(path.to_string()));
        }
        Ok(meta.len())
    }

    fn list_dir(&self, path: &str, recursive: bool) -> Result<Vec<String>> {
        let host = self.host_path(path);
        if !host.exists() {
            return Err(StorageError::NotFound(path.to_string()));
        }
        if !host.is_dir() {
            return Err(StorageError::NotADirectory(path.to_string()));
        }

        let max_depth = if recursive { usize::MAX } else { 1 };
        let mut entries = Vec::new();
        for entry in WalkDir::new(&host).min_depth(1).max_depth(max_depth) {
            let entry = entry.map_err(|e| {
                StorageError::Io(e.into_io_error().unwrap_or_else(|| io::Error::other("walk failed")))
            })?;
            let name = entry.file_name().to_string_lossy();
            if name.ends_with(TEMP_SUFFIX) {
                continue;
            }
            let relative = match entry.path().strip_prefix(&host) {
                Ok(rel) => rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/"),
                Err(_) => continue,
            };
            if entry.file_type().is_dir() {
                entries.push(format!("{}/", relative));
            } else {
                entries.push(relative);
            }
        }
        entries.sort();
        Ok(entries)
    }

    fn delete_file(&self, path: &str) -> Result<()> {
        let host = self.host_path(path);
        if host.is_dir() {
            return Err(StorageError::IsADirectory(path.to_string()));
        }
        fs::remove_file(&host).map_err(|e| map_io(e, path))
    }

    fn delete_dir(&self, path: &str) -> Result<()> {
        let host = self.host_path(path);
        if !host.exists() {
            return Err(StorageError::NotFound(path.to_string()));
        }
        if !host.is_dir() {
            return Err(StorageError::NotADirectory(path.to_string()));
        }
        fs::remove_dir_all(&host).map_err(|e| map_io(e, path))
    }

    fn local_path(&self, path: &str) -> Option<PathBuf> {
        Some(self.host_path(path))
    }

    fn name(&self) -> &'static str {
        "disk"
    }
}
