//! Directories of the memory tier.

use std::sync::{Arc, Mutex};

use pkgfs_config::{log_dir_debug, OpenType};
use pkgfs_package::PackageFileWriter;

use crate::directory::{Directory, DirectoryKind, DirectoryPtr, TierDirectory};
use crate::file::{FileReader, FileWriter, WriterOptions};
use crate::fs::{FileSystem, StorageTier};
use crate::link::LinkDirectory;
use crate::{DirectoryError, Result};

/// Directory backed by the memory tier.
///
/// `sync` copies the subtree to the same path on disk and mounts the
/// packages it holds there.
#[derive(Debug, Clone)]
pub struct InMemDirectory {
    inner: TierDirectory,
}

impl InMemDirectory {
    pub fn new(fs: Arc<FileSystem>, root: &str) -> Self {
        Self {
            inner: TierDirectory::new(fs, StorageTier::Memory, root),
        }
    }

    /// Sync this directory to disk and return a read-only view of the copy.
    pub fn create_link_directory(&self) -> Result<LinkDirectory> {
        self.sync(true)?;
        LinkDirectory::new(Arc::clone(self.inner.fs()), self.inner.root())
    }

    /// Apply `op` to the disk copy when a link directory exposes it.
    ///
    /// The pending state is synced first so the disk copy is complete.
    fn mirror_on_disk<F>(&self, paths: &[&str], op: F) -> Result<()>
    where
        F: FnOnce(&FileSystem) -> Result<()>,
    {
        let fs = self.inner.fs();
        if !paths.iter().any(|abs| fs.is_link_shadowed(abs)) {
            return Ok(());
        }
        self.sync(true)?;
        match op(fs) {
            Ok(()) | Err(DirectoryError::NonExist(_)) => {
                log_dir_debug!("Mirrored change under link directory", path = paths[0]);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl Directory for InMemDirectory {
    fn root(&self) -> &str {
        self.inner.root()
    }

    fn kind(&self) -> DirectoryKind {
        DirectoryKind::InMemory
    }

    fn file_system(&self) -> &Arc<FileSystem> {
        self.inner.fs()
    }

    fn create_file_writer(&self, path: &str, options: WriterOptions) -> Result<FileWriter> {
        self.inner.create_file_writer(path, options)
    }

    fn create_file_reader(&self, path: &str, open_type: OpenType) -> Result<FileReader> {
        self.inner.create_file_reader(path, open_type)
    }

    fn make_directory(&self, path: &str) -> Result<DirectoryPtr> {
        let abs = self.inner.make_dirs(path)?;
        Ok(Arc::new(InMemDirectory::new(Arc::clone(self.inner.fs()), &abs)))
    }

    fn get_directory(&self, path: &str, throw_if_not_exist: bool) -> Result<Option<DirectoryPtr>> {
        Ok(self
            .inner
            .child(path, throw_if_not_exist)?
            .map(|abs| Arc::new(InMemDirectory::new(Arc::clone(self.inner.fs()), &abs)) as DirectoryPtr))
    }

    fn create_package_file_writer(&self, name: &str) -> Result<Arc<Mutex<PackageFileWriter>>> {
        self.inner.create_package_file_writer(name)
    }

    fn get_package_file_writer(&self, name: &str) -> Option<Arc<Mutex<PackageFileWriter>>> {
        self.inner.get_package_file_writer(name)
    }

    fn mount_package_file(&self, name: &str) -> Result<bool> {
        self.inner.mount_package_file(name)
    }

    fn is_exist(&self, path: &str) -> bool {
        self.inner.is_exist(path)
    }

    fn get_file_length(&self, path: &str) -> Result<u64> {
        self.inner.get_file_length(path)
    }

    fn list_file(&self, path: &str, recursive: bool, physical: bool) -> Result<Vec<String>> {
        self.inner.list_file(path, recursive, physical)
    }

    fn remove_file(&self, path: &str) -> Result<()> {
        let abs = self.inner.resolve(path)?;
        self.mirror_on_disk(&[abs.as_str()], |fs| fs.remove_file(StorageTier::Disk, &abs))?;
        self.inner.remove_file(&abs)
    }

    fn remove_directory(&self, path: &str) -> Result<()> {
        let abs = self.inner.resolve(path)?;
        self.mirror_on_disk(&[abs.as_str()], |fs| fs.remove_directory(StorageTier::Disk, &abs))?;
        self.inner.remove_directory(&abs)
    }

    fn rename(&self, src: &str, dest_dir: &dyn Directory, dst: &str) -> Result<()> {
        let dst = self.inner.rename_target(dest_dir, DirectoryKind::InMemory, dst)?;
        let src = self.inner.resolve(src)?;
        if !pkgfs_storage::path::is_within(&dst, self.inner.root()) {
            return Err(DirectoryError::Unsupported(format!(
                "rename out of in-memory directory {}: {}",
                self.inner.root(),
                dst
            )));
        }
        self.mirror_on_disk(&[src.as_str(), dst.as_str()], |fs| fs.rename(StorageTier::Disk, &src, &dst))?;
        self.inner.rename(&src, &dst)
    }

    fn sync(&self, wait_finish: bool) -> Result<()> {
        self.inner.sync(wait_finish, true)
    }
}
