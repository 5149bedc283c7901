//! The directory contract shared by every variant.

use std::fmt;
use std::sync::{Arc, Mutex};

use pkgfs_config::OpenType;
use pkgfs_package::PackageFileWriter;
use pkgfs_storage::path;

use crate::file::{FileReader, FileWriter, WriterOptions};
use crate::fs::{FileSystem, StorageTier};
use crate::{DirectoryError, Result};

/// Shared directory handle.
pub type DirectoryPtr = Arc<dyn Directory>;

/// Directory variants known to [`DirectoryCreator`](crate::DirectoryCreator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirectoryKind {
    Local,
    InMemory,
    Link,
}

impl fmt::Display for DirectoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirectoryKind::Local => write!(f, "local"),
            DirectoryKind::InMemory => write!(f, "in_memory"),
            DirectoryKind::Link => write!(f, "link"),
        }
    }
}

/// A directory of the virtual tree.
///
/// Paths passed to a directory are relative to its [`root`](Self::root);
/// paths that escape the root fail with `InvalidPath`. Every query looks at
/// the mount tables first and at the raw storage backend second.
pub trait Directory: Send + Sync + fmt::Debug {
    /// Absolute virtual path of this directory.
    fn root(&self) -> &str;

    fn kind(&self) -> DirectoryKind;

    fn file_system(&self) -> &Arc<FileSystem>;

    fn create_file_writer(&self, path: &str, options: WriterOptions) -> Result<FileWriter>;

    fn create_file_reader(&self, path: &str, open_type: OpenType) -> Result<FileReader>;

    /// Create `path` (and missing parents); returns a directory of the same variant.
    fn make_directory(&self, path: &str) -> Result<DirectoryPtr>;

    /// Directory at `path`, `None` when absent unless `throw_if_not_exist`.
    fn get_directory(&self, path: &str, throw_if_not_exist: bool) -> Result<Option<DirectoryPtr>>;

    /// Writer for package `name`; returns the in-flight writer if there is one.
    fn create_package_file_writer(&self, name: &str) -> Result<Arc<Mutex<PackageFileWriter>>>;

    fn get_package_file_writer(&self, name: &str) -> Option<Arc<Mutex<PackageFileWriter>>>;

    /// Mount package `name`; `false` if it has no meta file.
    fn mount_package_file(&self, name: &str) -> Result<bool>;

    fn is_exist(&self, path: &str) -> bool;

    fn get_file_length(&self, path: &str) -> Result<u64>;

    /// Sorted listing relative to `path`; directories end with `/`.
    ///
    /// `physical` lists backend entries only, package physical files
    /// included. Otherwise inner files are listed and physical files hidden.
    fn list_file(&self, path: &str, recursive: bool, physical: bool) -> Result<Vec<String>>;

    fn remove_file(&self, path: &str) -> Result<()>;

    fn remove_directory(&self, path: &str) -> Result<()>;

    /// Move `src` of this directory to `dst` of `dest_dir`.
    fn rename(&self, src: &str, dest_dir: &dyn Directory, dst: &str) -> Result<()>;

    /// Flush staged writers under this directory.
    fn sync(&self, wait_finish: bool) -> Result<()>;
}

/// Absolute path of `rel` under `root`, rejecting escapes.
pub(crate) fn resolve(root: &str, rel: &str) -> Result<String> {
    let abs = path::join(root, rel);
    if path::is_within(&abs, root) {
        Ok(abs)
    } else {
        Err(DirectoryError::InvalidPath(format!(
            "{} escapes {}",
            rel, root
        )))
    }
}

/// A directory rooted in one storage tier.
#[derive(Debug, Clone)]
pub(crate) struct TierDirectory {
    root: String,
    fs: Arc<FileSystem>,
    tier: StorageTier,
}

impl TierDirectory {
    pub(crate) fn new(fs: Arc<FileSystem>, tier: StorageTier, root: &str) -> Self {
        Self {
            root: path::normalize(root),
            fs,
            tier,
        }
    }

    pub(crate) fn root(&self) -> &str {
        &self.root
    }

    pub(crate) fn fs(&self) -> &Arc<FileSystem> {
        &self.fs
    }

    pub(crate) fn resolve(&self, rel: &str) -> Result<String> {
        resolve(&self.root, rel)
    }

    /// Absolute path of the same-kind destination `dst` in `dest_dir`.
    pub(crate) fn rename_target(&self, dest_dir: &dyn Directory, kind: DirectoryKind, dst: &str) -> Result<String> {
        if dest_dir.kind() != kind || !Arc::ptr_eq(&self.fs, dest_dir.file_system()) {
            return Err(DirectoryError::Unsupported(format!(
                "rename from {} directory {} to {} directory {}",
                kind,
                self.root,
                dest_dir.kind(),
                dest_dir.root()
            )));
        }
        resolve(dest_dir.root(), dst)
    }

    pub(crate) fn create_file_writer(&self, rel: &str, options: WriterOptions) -> Result<FileWriter> {
        let abs = self.resolve(rel)?;
        self.fs.create_file_writer(self.tier, &abs, options)
    }

    pub(crate) fn create_file_reader(&self, rel: &str, open_type: OpenType) -> Result<FileReader> {
        let abs = self.resolve(rel)?;
        self.fs.open_reader(self.tier, &abs, open_type)
    }

    /// Create `rel`, returning its absolute path.
    pub(crate) fn make_dirs(&self, rel: &str) -> Result<String> {
        let abs = self.resolve(rel)?;
        self.fs.make_dirs(self.tier, &abs)?;
        Ok(abs)
    }

    /// Absolute path of the existing child directory `rel`.
    pub(crate) fn child(&self, rel: &str, throw_if_not_exist: bool) -> Result<Option<String>> {
        let abs = self.resolve(rel)?;
        if self.fs.is_directory(self.tier, &abs) {
            return Ok(Some(abs));
        }
        if !throw_if_not_exist {
            return Ok(None);
        }
        if self.fs.is_exist(self.tier, &abs) {
            Err(DirectoryError::InvalidPath(format!("not a directory: {}", abs)))
        } else {
            Err(DirectoryError::NonExist(abs))
        }
    }

    pub(crate) fn create_package_file_writer(&self, name: &str) -> Result<Arc<Mutex<PackageFileWriter>>> {
        let abs = self.resolve(name)?;
        self.fs.create_package_file_writer(self.tier, &abs)
    }

    pub(crate) fn get_package_file_writer(&self, name: &str) -> Option<Arc<Mutex<PackageFileWriter>>> {
        let abs = self.resolve(name).ok()?;
        self.fs.get_package_file_writer(self.tier, &abs)
    }

    pub(crate) fn mount_package_file(&self, name: &str) -> Result<bool> {
        let abs = self.resolve(name)?;
        self.fs.mount_package_file(self.tier, &abs)
    }

    pub(crate) fn is_exist(&self, rel: &str) -> bool {
        match self.resolve(rel) {
            Ok(abs) => self.fs.is_exist(self.tier, &abs),
            Err(_) => false,
        }
    }

    pub(crate) fn get_file_length(&self, rel: &str) -> Result<u64> {
        let abs = self.resolve(rel)?;
        self.fs.get_file_length(self.tier, &abs)
    }

    pub(crate) fn list_file(&self, rel: &str, recursive: bool, physical: bool) -> Result<Vec<String>> {
        let abs = self.resolve(rel)?;
        self.fs.list_file(self.tier, &abs, recursive, physical)
    }

    pub(crate) fn remove_file(&self, abs: &str) -> Result<()> {
        self.fs.remove_file(self.tier, abs)
    }

    pub(crate) fn remove_directory(&self, abs: &str) -> Result<()> {
        self.fs.remove_directory(self.tier, abs)
    }

    pub(crate) fn rename(&self, src: &str, dst: &str) -> Result<()> {
        self.fs.rename(self.tier, src, dst)
    }

    pub(crate) fn sync(&self, wait_finish: bool, mirror: bool) -> Result<()> {
        self.fs.flush(self.tier, &self.root, wait_finish, mirror)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_rejects_escapes() {
        assert_eq!(resolve("/seg", "index/a").unwrap(), "/seg/index/a");
        assert_eq!(resolve("/seg", "").unwrap(), "/seg");
        assert_eq!(resolve("/seg", "./a/../b").unwrap(), "/seg/b");
        assert!(matches!(
            resolve("/seg", "../other"),
            Err(DirectoryError::InvalidPath(_))
        ));
        assert_eq!(resolve("/", "a").unwrap(), "/a");
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(DirectoryKind::Local.to_string(), "local");
        assert_eq!(DirectoryKind::InMemory.to_string(), "in_memory");
        assert_eq!(DirectoryKind::Link.to_string(), "link");
    }
}
