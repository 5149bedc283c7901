//! # pkgfs-package
//!
//! Package file format for pkgfs.
//!
//! Many small per-segment files are consolidated into one package: a meta
//! file indexing every inner file and directory, plus one or more data files
//! holding the concatenated payload.
//!
//! ## Physical Layout
//!
//! ```text
//! <dir>/<name>.__meta__          JSON PackageFileMeta
//! <dir>/<name>.__data__<tag>0    payload of inner files, back to back
//! <dir>/<name>.__data__<tag>1    next data file once the size threshold is hit
//! ```
//!
//! Inner paths are relative to `<dir>`: the package `/seg_0/package_file`
//! holding `index/title` serves `/seg_0/index/title`.

mod meta;
mod naming;
mod writer;

pub use meta::{InnerFileMeta, PackageFileMeta, PackageStats, PhysicalFileEntry};
pub use naming::{
    is_package_physical_file, package_file_data_path, package_file_meta_path,
    package_path_of_meta, DATA_SUFFIX, META_SUFFIX,
};
pub use writer::{InnerFileWriter, PackageFileWriter, PackageSink, StorageSink};

use pkgfs_storage::StorageError;
use thiserror::Error;

/// Errors that can occur during package operations
#[derive(Error, Debug)]
pub enum PackageError {
    #[error("Malformed package meta: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid package meta: {0}")]
    Invalid(String),

    #[error("Duplicate inner path in package {package}: {path}")]
    Duplicate { package: String, path: String },

    #[error("Package writer already closed: {0}")]
    Closed(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, PackageError>;
