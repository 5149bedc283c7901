//! Read-only views of synced disk subtrees.

use std::sync::{Arc, Mutex};

use pkgfs_config::{log_dir_debug, OpenType};
use pkgfs_package::PackageFileWriter;
use pkgfs_storage::path;

use crate::directory::{Directory, DirectoryKind, DirectoryPtr};
use crate::file::{FileReader, FileWriter, WriterOptions};
use crate::fs::{FileSystem, StorageTier};
use crate::local::LocalDirectory;
use crate::{DirectoryError, Result};

/// Read-only directory over an existing disk subtree.
///
/// While a link directory is alive its root is registered as a link shadow,
/// which makes in-memory removals and renames under it reach disk too.
#[derive(Debug)]
pub struct LinkDirectory {
    local: LocalDirectory,
}

impl LinkDirectory {
    /// Wrap the disk directory `root`; fails with `NonExist` if it is absent.
    pub fn new(fs: Arc<FileSystem>, root: &str) -> Result<Self> {
        let root = path::normalize(root);
        if !fs.is_directory(StorageTier::Disk, &root) {
            return Err(DirectoryError::NonExist(root));
        }
        fs.register_link_shadow(&root);
        log_dir_debug!("Created link directory", root = root.as_str());
        Ok(Self {
            local: LocalDirectory::new(fs, &root),
        })
    }

    fn read_only(&self, op: &str, path: &str) -> DirectoryError {
        DirectoryError::Unsupported(format!(
            "{} in link directory {}: {}",
            op,
            self.local.root(),
            path
        ))
    }

    fn link(&self, abs: &str) -> Result<DirectoryPtr> {
        Ok(Arc::new(LinkDirectory::new(
            Arc::clone(self.local.file_system()),
            abs,
        )?))
    }
}

impl Drop for LinkDirectory {
    fn drop(&mut self) {
        self.local
            .file_system()
            .unregister_link_shadow(self.local.root());
    }
}

impl Directory for LinkDirectory {
    fn root(&self) -> &str {
        self.local.root()
    }

    fn kind(&self) -> DirectoryKind {
        DirectoryKind::Link
    }

    fn file_system(&self) -> &Arc<FileSystem> {
        self.local.file_system()
    }

    fn create_file_writer(&self, path: &str, _options: WriterOptions) -> Result<FileWriter> {
        Err(self.read_only("write", path))
    }

    fn create_file_reader(&self, path: &str, open_type: OpenType) -> Result<FileReader> {
        self.local.create_file_reader(path, open_type)
    }

    /// Existing children only.
    fn make_directory(&self, path: &str) -> Result<DirectoryPtr> {
        match self.local.get_directory(path, false)? {
            Some(dir) => self.link(dir.root()),
            None => Err(self.read_only("make directory", path)),
        }
    }

    fn get_directory(&self, path: &str, throw_if_not_exist: bool) -> Result<Option<DirectoryPtr>> {
        match self.local.get_directory(path, throw_if_not_exist)? {
            Some(dir) => self.link(dir.root()).map(Some),
            None => Ok(None),
        }
    }

    fn create_package_file_writer(&self, name: &str) -> Result<Arc<Mutex<PackageFileWriter>>> {
        Err(self.read_only("package write", name))
    }

    fn get_package_file_writer(&self, _name: &str) -> Option<Arc<Mutex<PackageFileWriter>>> {
        None
    }

    fn mount_package_file(&self, name: &str) -> Result<bool> {
        self.local.mount_package_file(name)
    }

    fn is_exist(&self, path: &str) -> bool {
        self.local.is_exist(path)
    }

    fn get_file_length(&self, path: &str) -> Result<u64> {
        self.local.get_file_length(path)
    }

    fn list_file(&self, path: &str, recursive: bool, physical: bool) -> Result<Vec<String>> {
        self.local.list_file(path, recursive, physical)
    }

    fn remove_file(&self, path: &str) -> Result<()> {
        Err(self.read_only("remove", path))
    }

    fn remove_directory(&self, path: &str) -> Result<()> {
        Err(self.read_only("remove", path))
    }

    fn rename(&self, src: &str, _dest_dir: &dyn Directory, _dst: &str) -> Result<()> {
        Err(self.read_only("rename", src))
    }

    /// Nothing is ever staged through a link directory.
    fn sync(&self, _wait_finish: bool) -> Result<()> {
        Ok(())
    }
}
