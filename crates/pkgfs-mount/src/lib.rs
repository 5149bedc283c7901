//! # pkgfs-mount
//!
//! Mount table for package files.
//!
//! Mounting a package loads its meta and flattens every inner entry into an
//! ordered map from absolute virtual path to [`InnerFileMeta`]. Physical data
//! files are shared through explicit reference counts: each mounted inner
//! file holds one reference on the data file it points into, and a data file
//! is deleted from storage exactly when its count drops to zero.
//!
//! Absence is never an error here: lookups return `Option`/`bool`. Only
//! corruption (two packages claiming the same file) is an `Err`.

mod metrics;
mod table;

pub use metrics::{MetricsCollector, MountStats};
pub use table::{PackageFileMountTable, PhysicalFileInfo};

pub use pkgfs_package::InnerFileMeta;

use pkgfs_package::PackageError;
use pkgfs_storage::StorageError;
use thiserror::Error;

/// Errors that can occur during mount operations
#[derive(Error, Debug)]
pub enum MountError {
    #[error("Inconsistent mount state: {0}")]
    InconsistentState(String),

    #[error("Package error: {0}")]
    Package(#[from] PackageError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, MountError>;
