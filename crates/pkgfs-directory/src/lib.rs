//! # pkgfs-directory
//!
//! Uniform directory tree over the pkgfs storage tiers.
//!
//! A [`FileSystem`] owns two tiers (disk and memory), the package mount
//! tables of each tier, in-flight package writers, staged dumps and the
//! reader cache. Directories are cheap handles `{root, Arc<FileSystem>}`:
//!
//! - [`LocalDirectory`]: disk tier
//! - [`InMemDirectory`]: memory tier, mirrored to disk on sync
//! - [`LinkDirectory`]: read-only view of an already-synced disk subtree
//!
//! Every query consults the mount tables first and falls back to the raw
//! storage backend for loose (unpackaged) files.

mod creator;
mod directory;
mod file;
mod fs;
mod in_mem;
mod link;
mod local;

pub use creator::{DirectoryCreator, DirectoryFactory};
pub use directory::{Directory, DirectoryKind, DirectoryPtr};
pub use file::{FileReader, FileWriter, WriterOptions, CACHE_BLOCK_SIZE};
pub use fs::{FileSystem, FileSystemOptions, StorageTier};
pub use in_mem::InMemDirectory;
pub use link::LinkDirectory;
pub use local::LocalDirectory;

pub use pkgfs_config::OpenType;

use pkgfs_mount::MountError;
use pkgfs_package::PackageError;
use pkgfs_storage::StorageError;
use thiserror::Error;

/// Errors that can occur during directory operations
#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("Inconsistent state: {0}")]
    InconsistentState(String),

    #[error("Already exists: {0}")]
    Exist(String),

    #[error("No such file or directory: {0}")]
    NonExist(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Package error: {0}")]
    Package(#[from] PackageError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<MountError> for DirectoryError {
    fn from(e: MountError) -> Self {
        match e {
            MountError::InconsistentState(msg) => DirectoryError::InconsistentState(msg),
            MountError::Package(e) => DirectoryError::Package(e),
            MountError::Storage(e) => DirectoryError::Storage(e),
        }
    }
}

impl DirectoryError {
    /// Map a storage failure on `path` onto the directory taxonomy.
    pub(crate) fn from_storage(e: StorageError, path: &str) -> Self {
        match e {
            StorageError::NotFound(_) => DirectoryError::NonExist(path.to_string()),
            StorageError::AlreadyExists(_) => DirectoryError::Exist(path.to_string()),
            StorageError::NotADirectory(p) => {
                DirectoryError::InvalidPath(format!("not a directory: {}", p))
            }
            StorageError::IsADirectory(p) => {
                DirectoryError::InvalidPath(format!("is a directory: {}", p))
            }
            e if e.is_not_found() => DirectoryError::NonExist(path.to_string()),
            e => DirectoryError::Storage(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, DirectoryError>;
