//! The mount table proper.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use pkgfs_config::{log_mount_debug, log_mount_info, log_mount_warn};
use pkgfs_package::{package_file_meta_path, InnerFileMeta, PackageFileMeta};
use pkgfs_storage::{path, StorageBackend};

use crate::metrics::{MetricsCollector, MountStats};
use crate::{MountError, Result};

/// A physical data file shared by the inner files pointing into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalFileInfo {
    pub physical_path: String,
    pub package_path: String,
    pub length: u64,
    /// Mounted inner file entries referencing this data file
    pub ref_count: usize,
}

#[derive(Debug, Clone)]
struct MountEntry {
    meta: InnerFileMeta,
    package_path: String,
    /// Data file holding the bytes; `None` for directories
    physical_path: Option<String>,
}

#[derive(Debug)]
struct MountedPackage {
    meta_path: String,
    data_paths: Vec<String>,
}

#[derive(Debug, Default)]
struct TableState {
    entries: BTreeMap<String, MountEntry>,
    physical: HashMap<String, PhysicalFileInfo>,
    packages: BTreeMap<String, MountedPackage>,
    stats: MountStats,
}

fn child_prefix(dir: &str) -> String {
    if dir == "/" {
        "/".to_string()
    } else {
        format!("{}/", dir)
    }
}

/// Entries strictly under `dir`, in key order.
fn under<'a>(
    entries: &'a BTreeMap<String, MountEntry>,
    dir: &str,
) -> impl Iterator<Item = (&'a String, &'a MountEntry)> {
    let prefix = child_prefix(dir);
    let dir = dir.to_string();
    entries
        .range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded))
        .take_while(move |(k, _)| k.starts_with(&prefix))
        .filter(move |(k, _)| **k != dir)
}

fn duplicate(abs: &str, owner: &str, package: &str) -> MountError {
    MountError::InconsistentState(format!(
        "duplicate inner path {} in package {} (already mounted from {})",
        abs, package, owner
    ))
}

/// Mount table rooted at one virtual directory.
///
/// Every mutator holds the write lock across its whole
/// increment/decrement/delete sequence.
pub struct PackageFileMountTable {
    root: String,
    storage: Arc<dyn StorageBackend>,
    state: RwLock<TableState>,
    metrics: Option<Arc<dyn MetricsCollector>>,
}

impl std::fmt::Debug for PackageFileMountTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageFileMountTable")
            .field("root", &self.root)
            .field("storage", &self.storage.name())
            .field("entries", &self.len())
            .finish()
    }
}

impl PackageFileMountTable {
    /// Create an empty table for packages under `root`, stored in `storage`.
    pub fn new(root: &str, storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            root: path::normalize(root),
            storage,
            state: RwLock::new(TableState::default()),
            metrics: None,
        }
    }

    /// Report statistics to `metrics` after every mutation.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    fn read(&self) -> RwLockReadGuard<'_, TableState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, TableState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn report(&self, stats: MountStats) {
        if let Some(metrics) = &self.metrics {
            metrics.report_mount_stats(&self.root, &stats);
        }
    }

    /// Mount the package at `package_path`.
    ///
    /// Returns `Ok(false)` when the package has no meta file and `Ok(true)`
    /// without touching the table when it is already mounted. A file path
    /// already claimed by another entry fails with `InconsistentState` and
    /// leaves the table unchanged.
    pub fn mount_package_file(&self, package_path: &str) -> Result<bool> {
        let package_path = path::normalize(package_path);
        if self.read().packages.contains_key(&package_path) {
            log_mount_debug!("Package already mounted", package = package_path.as_str());
            return Ok(true);
        }
        if !path::is_within(&package_path, &self.root) {
            return Err(MountError::InconsistentState(format!(
                "package {} is outside mount root {}",
                package_path, self.root
            )));
        }
        let Some(meta) = PackageFileMeta::load(self.storage.as_ref(), &package_path)? else {
            log_mount_debug!("No meta file for package", package = package_path.as_str());
            return Ok(false);
        };

        let mut state = self.write();
        if state.packages.contains_key(&package_path) {
            return Ok(true);
        }

        let mut staged: BTreeMap<String, MountEntry> = BTreeMap::new();
        for inner in meta.inner_files() {
            let abs = PackageFileMeta::inner_file_path(&package_path, inner);
            if let Some(existing) = state.entries.get(&abs).or_else(|| staged.get(&abs)) {
                if existing.meta.is_dir && inner.is_dir {
                    continue;
                }
                return Err(duplicate(&abs, &existing.package_path, &package_path));
            }
            if !inner.is_dir {
                let shadowed = under(&state.entries, &abs)
                    .chain(under(&staged, &abs))
                    .next()
                    .map(|(_, e)| e.package_path.clone());
                if let Some(owner) = shadowed {
                    return Err(duplicate(&abs, &owner, &package_path));
                }
            }
            let mut ancestor = path::parent(&abs);
            while let Some(dir) = ancestor {
                if let Some(e) = state.entries.get(&dir).or_else(|| staged.get(&dir)) {
                    if !e.meta.is_dir {
                        return Err(duplicate(&dir, &e.package_path, &package_path));
                    }
                }
                ancestor = path::parent(&dir);
            }

            let physical_path = if inner.is_dir {
                None
            } else {
                let Some(p) = meta.physical_file_path(&package_path, inner.physical_file_index)
                else {
                    return Err(MountError::InconsistentState(format!(
                        "{} points at missing data file {}",
                        abs, inner.physical_file_index
                    )));
                };
                Some(p)
            };
            staged.insert(
                abs,
                MountEntry {
                    meta: inner.clone(),
                    package_path: package_path.clone(),
                    physical_path,
                },
            );
        }

        // Validation passed; from here on nothing fails.
        let mut data_paths = Vec::with_capacity(meta.physical_files.len());
        for (idx, entry) in meta.physical_files.iter().enumerate() {
            let Some(data_path) = meta.physical_file_path(&package_path, idx) else {
                continue;
            };
            if !state.physical.contains_key(&data_path) {
                state.stats.physical_file_count += 1;
                state.physical.insert(
                    data_path.clone(),
                    PhysicalFileInfo {
                        physical_path: data_path.clone(),
                        package_path: package_path.clone(),
                        length: entry.length,
                        ref_count: 0,
                    },
                );
            }
            data_paths.push(data_path);
        }

        let (mut files, mut dirs) = (0u64, 0u64);
        for (abs, entry) in staged {
            match &entry.physical_path {
                Some(p) => {
                    if let Some(info) = state.physical.get_mut(p) {
                        info.ref_count += 1;
                    }
                    files += 1;
                }
                None => dirs += 1,
            }
            state.entries.insert(abs, entry);
        }
        state.packages.insert(
            package_path.clone(),
            MountedPackage {
                meta_path: package_file_meta_path(&package_path),
                data_paths,
            },
        );
        state.stats.package_count += 1;
        state.stats.inner_file_count += files;
        state.stats.inner_dir_count += dirs;
        let snapshot = state.stats;
        drop(state);

        log_mount_info!(
            "Mounted package",
            package = package_path.as_str(),
            files = files,
            dirs = dirs
        );
        self.report(snapshot);
        Ok(true)
    }

    /// Meta of the entry at `abs_path`.
    pub fn get_mount_meta(&self, abs_path: &str) -> Option<InnerFileMeta> {
        self.read()
            .entries
            .get(&path::normalize(abs_path))
            .map(|e| e.meta.clone())
    }

    /// `(data file, offset, length)` backing the inner file at `abs_path`.
    pub fn physical_location(&self, abs_path: &str) -> Option<(String, u64, u64)> {
        let state = self.read();
        let entry = state.entries.get(&path::normalize(abs_path))?;
        let physical = entry.physical_path.clone()?;
        Some((physical, entry.meta.offset, entry.meta.length))
    }

    /// Length of a registered physical data file.
    pub fn get_package_file_length(&self, physical_path: &str) -> Option<u64> {
        self.read()
            .physical
            .get(&path::normalize(physical_path))
            .map(|info| info.length)
    }

    /// Reference count of a registered physical data file.
    pub fn physical_ref_count(&self, physical_path: &str) -> Option<usize> {
        self.read()
            .physical
            .get(&path::normalize(physical_path))
            .map(|info| info.ref_count)
    }

    /// Snapshot of every registered physical data file, by path.
    pub fn physical_files(&self) -> Vec<PhysicalFileInfo> {
        let mut infos: Vec<_> = self.read().physical.values().cloned().collect();
        infos.sort_by(|a, b| a.physical_path.cmp(&b.physical_path));
        infos
    }

    /// True if `abs_path` is an entry or an ancestor of one.
    pub fn is_exist(&self, abs_path: &str) -> bool {
        let abs = path::normalize(abs_path);
        let state = self.read();
        state.entries.contains_key(&abs) || under(&state.entries, &abs).next().is_some()
    }

    /// List entries under `dir_path`, relative to it.
    ///
    /// Directories end with `/`. Non-recursive listings collapse deeper
    /// entries into their immediate child. Absent or non-directory paths
    /// list as empty.
    pub fn list_file(&self, dir_path: &str, recursive: bool) -> Vec<String> {
        let dir = path::normalize(dir_path);
        let state = self.read();
        if let Some(entry) = state.entries.get(&dir) {
            if !entry.meta.is_dir {
                return Vec::new();
            }
        }

        let mut listing = BTreeSet::new();
        for (key, entry) in under(&state.entries, &dir) {
            let Some(rel) = path::relative_to(key, &dir) else {
                continue;
            };
            let leaf = if entry.meta.is_dir {
                format!("{}/", rel)
            } else {
                rel.to_string()
            };
            if recursive {
                let mut end = 0;
                while let Some(pos) = rel[end..].find('/') {
                    end += pos;
                    listing.insert(format!("{}/", &rel[..end]));
                    end += 1;
                }
                listing.insert(leaf);
            } else {
                match rel.find('/') {
                    Some(pos) => listing.insert(format!("{}/", &rel[..pos])),
                    None => listing.insert(leaf),
                };
            }
        }
        listing.into_iter().collect()
    }

    /// Remove the inner file at `abs_path`.
    ///
    /// Returns `Ok(false)` if there is no such file (directories included).
    pub fn remove_file(&self, abs_path: &str) -> Result<bool> {
        let abs = path::normalize(abs_path);
        let mut state = self.write();
        if !matches!(state.entries.get(&abs), Some(e) if !e.meta.is_dir) {
            return Ok(false);
        }
        if let Some(entry) = state.entries.remove(&abs) {
            self.release_entry(&mut state, entry)?;
        }
        let snapshot = state.stats;
        drop(state);

        log_mount_debug!("Removed inner file", path = abs.as_str());
        self.report(snapshot);
        Ok(true)
    }

    /// Remove `dir_path` and everything under it.
    ///
    /// Returns `Ok(false)` if nothing is mounted there. The table root is
    /// always removable and leaves the table empty.
    pub fn remove_directory(&self, dir_path: &str) -> Result<bool> {
        let dir = path::normalize(dir_path);
        let is_root = dir == self.root;
        let mut state = self.write();
        if let Some(entry) = state.entries.get(&dir) {
            if !entry.meta.is_dir {
                return Ok(false);
            }
        }

        let mut keys: Vec<String> = under(&state.entries, &dir).map(|(k, _)| k.clone()).collect();
        if state.entries.contains_key(&dir) {
            keys.push(dir.clone());
        }
        if keys.is_empty() && !is_root {
            return Ok(false);
        }

        let removed = keys.len();
        for key in keys {
            if let Some(entry) = state.entries.remove(&key) {
                self.release_entry(&mut state, entry)?;
            }
        }
        self.release_idle_packages(&mut state, &dir);
        let snapshot = state.stats;
        drop(state);

        log_mount_info!(
            "Removed directory",
            path = dir.as_str(),
            entries = removed
        );
        self.report(snapshot);
        Ok(true)
    }

    /// Drop the references held by a removed entry.
    fn release_entry(&self, state: &mut TableState, entry: MountEntry) -> Result<()> {
        let Some(physical_path) = entry.physical_path else {
            state.stats.inner_dir_count = state.stats.inner_dir_count.saturating_sub(1);
            return Ok(());
        };
        state.stats.inner_file_count = state.stats.inner_file_count.saturating_sub(1);

        let Some(info) = state.physical.get_mut(&physical_path) else {
            return Err(MountError::InconsistentState(format!(
                "{} has no physical file info for {}",
                entry.meta.path, physical_path
            )));
        };
        if info.ref_count == 0 {
            return Err(MountError::InconsistentState(format!(
                "reference count underflow on {}",
                physical_path
            )));
        }
        info.ref_count -= 1;
        if info.ref_count > 0 {
            return Ok(());
        }

        let package_path = info.package_path.clone();
        self.delete_physical(state, &physical_path);

        let fully_released = match state.packages.get(&package_path) {
            Some(package) => package.data_paths.iter().all(|p| {
                state
                    .physical
                    .get(p)
                    .map_or(true, |info| info.ref_count == 0)
            }),
            None => false,
        };
        if fully_released {
            self.release_package(state, &package_path);
        }
        Ok(())
    }

    /// Release mounted packages under `dir` that no entry references any more.
    fn release_idle_packages(&self, state: &mut TableState, dir: &str) {
        let idle: Vec<String> = state
            .packages
            .iter()
            .filter(|(package_path, _)| path::is_within(package_path, dir))
            .filter(|(_, package)| {
                package.data_paths.iter().all(|p| {
                    state
                        .physical
                        .get(p)
                        .map_or(true, |info| info.ref_count == 0)
                })
            })
            .map(|(package_path, _)| package_path.clone())
            .collect();
        for package_path in idle {
            self.release_package(state, &package_path);
        }
    }

    /// Delete every remaining data file and the meta file of a package.
    fn release_package(&self, state: &mut TableState, package_path: &str) {
        let Some(package) = state.packages.remove(package_path) else {
            return;
        };
        for data_path in &package.data_paths {
            if state.physical.contains_key(data_path) {
                self.delete_physical(state, data_path);
            }
        }
        if let Err(e) = self.storage.delete_file(&package.meta_path) {
            if !e.is_not_found() {
                log_mount_warn!(
                    "Failed to delete package meta",
                    path = package.meta_path.as_str(),
                    error = e.to_string()
                );
            }
        }
        state.stats.package_count = state.stats.package_count.saturating_sub(1);
        log_mount_info!("Released package", package = package_path);
    }

    fn delete_physical(&self, state: &mut TableState, physical_path: &str) {
        state.physical.remove(physical_path);
        state.stats.physical_file_count = state.stats.physical_file_count.saturating_sub(1);
        state.stats.physical_files_deleted += 1;
        if let Err(e) = self.storage.delete_file(physical_path) {
            if !e.is_not_found() {
                log_mount_warn!(
                    "Failed to delete data file",
                    path = physical_path,
                    error = e.to_string()
                );
            }
        }
    }

    /// Packages currently mounted, sorted.
    pub fn mounted_packages(&self) -> Vec<String> {
        self.read().packages.keys().cloned().collect()
    }

    pub fn is_mounted(&self, package_path: &str) -> bool {
        self.read()
            .packages
            .contains_key(&path::normalize(package_path))
    }

    pub fn stats(&self) -> MountStats {
        self.read().stats
    }

    /// Number of entries (files and directories) in the table.
    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkgfs_package::{PackageFileWriter, StorageSink};
    use pkgfs_storage::MemStorage;

    fn write_package(storage: &Arc<dyn StorageBackend>, package: &str, files: &[(&str, &[u8])]) {
        let sink = Arc::new(StorageSink::new(storage.clone()));
        let mut writer = PackageFileWriter::new(package, 0, sink);
        for (rel, data) in files {
            writer.create_inner_file_writer(rel).unwrap().write(data).unwrap();
        }
        writer.close().unwrap();
    }

    fn setup() -> (Arc<dyn StorageBackend>, PackageFileMountTable) {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemStorage::new());
        let table = PackageFileMountTable::new("/", storage.clone());
        (storage, table)
    }

    #[test]
    fn test_mount_missing_meta_returns_false() {
        let (_storage, table) = setup();
        assert!(!table.mount_package_file("/seg/package_file").unwrap());
        assert!(table.is_empty());
    }

    #[test]
    fn test_lookup_after_mount() {
        let (storage, table) = setup();
        write_package(
            &storage,
            "/seg/package_file",
            &[("file1", b"abcd"), ("index/file2", b"12345")],
        );
        assert!(table.mount_package_file("/seg/package_file").unwrap());

        let meta = table.get_mount_meta("/seg/index/file2").unwrap();
        assert_eq!(meta.length, 5);
        assert_eq!(meta.offset, 4);
        assert!(table.get_mount_meta("/seg/index").unwrap().is_dir);
        assert_eq!(
            table.physical_location("/seg/file1"),
            Some(("/seg/package_file.__data__0".to_string(), 0, 4))
        );
        assert_eq!(table.physical_location("/seg/index"), None);
        assert_eq!(
            table.physical_ref_count("/seg/package_file.__data__0"),
            Some(2)
        );
        assert_eq!(
            table.get_package_file_length("/seg/package_file.__data__0"),
            Some(9)
        );
    }

    #[test]
    fn test_is_exist_with_trailing_separator() {
        let (storage, table) = setup();
        write_package(&storage, "/seg/package_file", &[("index/file2", b"12345")]);
        table.mount_package_file("/seg/package_file").unwrap();

        assert!(table.is_exist("/seg/index"));
        assert!(table.is_exist("/seg/index/"));
        assert!(table.is_exist("/seg"));
        assert!(!table.is_exist("/seg/ind"));
        assert!(!table.is_exist("/seg/index/file3"));
    }

    #[test]
    fn test_list_file_collapses_when_not_recursive() {
        let (storage, table) = setup();
        write_package(
            &storage,
            "/seg/package_file",
            &[("a", b"1"), ("x/b", b"2"), ("x/y/c", b"3")],
        );
        table.mount_package_file("/seg/package_file").unwrap();

        assert_eq!(table.list_file("/seg", false), vec!["a", "x/"]);
        assert_eq!(
            table.list_file("/seg/", true),
            vec!["a", "x/", "x/b", "x/y/", "x/y/c"]
        );
        assert_eq!(table.list_file("/seg/x", false), vec!["b", "y/"]);
        assert!(table.list_file("/seg/a", false).is_empty());
        assert!(table.list_file("/nope", true).is_empty());
    }

    #[test]
    fn test_remove_file_not_found_or_directory() {
        let (storage, table) = setup();
        write_package(&storage, "/seg/package_file", &[("index/file2", b"12345")]);
        table.mount_package_file("/seg/package_file").unwrap();

        assert!(!table.remove_file("/seg/file_nonexist").unwrap());
        assert!(!table.remove_file("/seg/index").unwrap());
        assert!(!table.remove_directory("/seg/index/file2").unwrap());
        assert!(!table.remove_directory("/other").unwrap());
    }

    #[test]
    fn test_last_reference_deletes_package_files() {
        let (storage, table) = setup();
        write_package(&storage, "/seg/package_file", &[("f1", b"a"), ("f2", b"b")]);
        table.mount_package_file("/seg/package_file").unwrap();

        assert!(table.remove_file("/seg/f1").unwrap());
        assert!(storage.exists("/seg/package_file.__data__0"));
        assert!(table.is_mounted("/seg/package_file"));

        assert!(table.remove_file("/seg/f2").unwrap());
        assert!(!storage.exists("/seg/package_file.__data__0"));
        assert!(!storage.exists("/seg/package_file.__meta__"));
        assert!(!table.is_mounted("/seg/package_file"));
        assert_eq!(table.physical_ref_count("/seg/package_file.__data__0"), None);

        let stats = table.stats();
        assert_eq!(stats.package_count, 0);
        assert_eq!(stats.inner_file_count, 0);
        assert_eq!(stats.physical_files_deleted, 1);
    }

    #[test]
    fn test_remove_root_clears_table() {
        let (storage, table) = setup();
        write_package(&storage, "/seg/p1", &[("a/f", b"1")]);
        write_package(&storage, "/seg/p2", &[]);
        table.mount_package_file("/seg/p1").unwrap();
        table.mount_package_file("/seg/p2").unwrap();

        assert!(table.remove_directory("/").unwrap());
        assert!(table.is_empty());
        assert!(table.mounted_packages().is_empty());
        assert!(!storage.exists("/seg/p2.__meta__"));
        assert!(table.remove_directory("/").unwrap());
    }

    #[test]
    fn test_outside_root_is_inconsistent() {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemStorage::new());
        let table = PackageFileMountTable::new("/part_0", storage);
        assert!(matches!(
            table.mount_package_file("/part_1/seg/package_file"),
            Err(MountError::InconsistentState(_))
        ));
    }
}
