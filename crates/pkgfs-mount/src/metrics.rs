//! Mount statistics.

/// Counters of a mount table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MountStats {
    /// Packages currently in the mounted set
    pub package_count: u64,
    /// Inner file entries in the table
    pub inner_file_count: u64,
    /// Inner directory entries in the table (shared directories count once)
    pub inner_dir_count: u64,
    /// Physical data files with a live `PhysicalFileInfo`
    pub physical_file_count: u64,
    /// Data files deleted after their reference count reached zero
    pub physical_files_deleted: u64,
}

/// External sink for mount statistics.
///
/// Receives a snapshot after every mutation of the table.
pub trait MetricsCollector: Send + Sync {
    fn report_mount_stats(&self, root: &str, stats: &MountStats);
}
