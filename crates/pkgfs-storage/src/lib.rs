//! # pkgfs-storage
//!
//! Byte-level storage backends for pkgfs.
//!
//! Every backend addresses content through virtual paths (`/seg_0/index/file`),
//! never through host paths, so the same directory tree can live on disk or
//! in memory.
//!
//! ## Backends
//!
//! - [`DiskStorage`]: files under a host directory, atomic writes via
//!   temp file + link/rename
//! - [`MemStorage`]: ordered in-memory tree, used for the buffered tier and
//!   for tests

mod disk;
mod memory;
pub mod path;

pub use disk::DiskStorage;
pub use memory::MemStorage;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("No such file or directory: {0}")]
    NotFound(String),

    #[error("File already exists: {0}")]
    AlreadyExists(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Read past end of {path}: offset {offset} + {len} > {file_len}")]
    OutOfRange {
        path: String,
        offset: u64,
        len: usize,
        file_len: u64,
    },
}

impl StorageError {
    /// True for "the path is simply not there" failures.
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::NotFound(_) => true,
            StorageError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// End offset of `len` bytes at `offset`, if they fit a file of `file_len` bytes.
pub fn checked_range_end(path: &str, offset: u64, len: usize, file_len: u64) -> Result<u64> {
    match offset.checked_add(len as u64) {
        Some(end) if end <= file_len => Ok(end),
        _ => Err(StorageError::OutOfRange {
            path: path.to_string(),
            offset,
            len,
            file_len,
        }),
    }
}

/// Byte-level file operations over virtual paths.
///
/// Directory listings are relative to the listed directory, sorted, and mark
/// directories with a trailing `/`.
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    /// True if a file or directory exists at `path`.
    fn exists(&self, path: &str) -> bool;

    /// True if `path` is an existing directory.
    fn is_dir(&self, path: &str) -> bool;

    /// Create a directory. Succeeds if it already exists as a directory.
    fn mkdir(&self, path: &str, recursive: bool) -> Result<()>;

    /// Write `data` to `path`, replacing any previous content.
    fn store(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Write `data` to `path` only if nothing exists there yet.
    ///
    /// The check and the write are one atomic step: a concurrent writer that
    /// got there first makes this fail with [`StorageError::AlreadyExists`].
    fn atomic_store(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Read the whole file.
    fn atomic_load(&self, path: &str) -> Result<Vec<u8>>;

    /// Read `len` bytes starting at `offset`.
    fn read_range(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        let data = self.atomic_load(path)?;
        let end = checked_range_end(path, offset, len, data.len() as u64)? as usize;
        Ok(data[offset as usize..end].to_vec())
    }

    /// Move a file or directory. Fails if `to` already exists.
    fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Length of a file in bytes.
    fn get_length(&self, path: &str) -> Result<u64>;

    /// List a directory (see trait docs for the entry format).
    fn list_dir(&self, path: &str, recursive: bool) -> Result<Vec<String>>;

    /// Delete a single file.
    fn delete_file(&self, path: &str) -> Result<()>;

    /// Delete a directory and everything under it.
    fn delete_dir(&self, path: &str) -> Result<()>;

    /// Host path backing `path`, for backends that can be memory-mapped.
    fn local_path(&self, _path: &str) -> Option<PathBuf> {
        None
    }

    /// Name of this backend (for logging/debugging)
    fn name(&self) -> &'static str;
}
