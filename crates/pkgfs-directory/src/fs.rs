//! The file system shared by every directory handle.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use memmap2::Mmap;

use pkgfs_config::{
    log_dir_debug, log_dir_warn, Config, LoadConfig, OpenType, DEFAULT_PACKAGE_DATA_FILE_SIZE,
};
use pkgfs_mount::{InnerFileMeta, MetricsCollector, PackageFileMountTable};
use pkgfs_package::{
    is_package_physical_file, package_file_meta_path, package_path_of_meta, PackageFileMeta,
    PackageFileWriter, PackageSink,
};
use pkgfs_storage::{path, DiskStorage, MemStorage, StorageBackend, StorageError};

use crate::file::{
    lock, BlockCache, CacheKind, FileReader, FileWriter, ReadSource, ReaderCache, WriterOptions,
};
use crate::{DirectoryError, Result};

/// Storage tier a directory lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageTier {
    Disk,
    Memory,
}

/// Options of a [`FileSystem`].
#[derive(Clone)]
pub struct FileSystemOptions {
    /// Data file size threshold of package writers (0 = unlimited)
    pub package_data_file_size: u64,
    /// Resolves `OpenType::Auto`
    pub load: LoadConfig,
    /// Receives statistics of every mount table
    pub metrics: Option<Arc<dyn MetricsCollector>>,
}

impl Default for FileSystemOptions {
    fn default() -> Self {
        Self {
            package_data_file_size: DEFAULT_PACKAGE_DATA_FILE_SIZE,
            load: LoadConfig::default(),
            metrics: None,
        }
    }
}

impl std::fmt::Debug for FileSystemOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystemOptions")
            .field("package_data_file_size", &self.package_data_file_size)
            .field("load", &self.load)
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}

impl FileSystemOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            package_data_file_size: config.storage.package_data_file_size,
            load: config.load.clone(),
            metrics: None,
        }
    }
}

/// One storage tier with its mount tables.
///
/// The root table always exists; extra tables added with
/// `mount_*_storage` take the packages under their root (longest prefix).
pub(crate) struct Tier {
    kind: StorageTier,
    storage: Arc<dyn StorageBackend>,
    root_table: Arc<PackageFileMountTable>,
    tables: RwLock<BTreeMap<String, Arc<PackageFileMountTable>>>,
    metrics: Option<Arc<dyn MetricsCollector>>,
    /// Serializes mounts so the cross-table check and the mount stay atomic
    mounting: Mutex<()>,
}

impl Tier {
    fn new(
        kind: StorageTier,
        storage: Arc<dyn StorageBackend>,
        metrics: Option<Arc<dyn MetricsCollector>>,
    ) -> Self {
        let root_table = Arc::new(Self::table(&storage, &metrics, "/"));
        Self {
            kind,
            storage,
            root_table,
            tables: RwLock::new(BTreeMap::new()),
            metrics,
            mounting: Mutex::new(()),
        }
    }

    fn table(
        storage: &Arc<dyn StorageBackend>,
        metrics: &Option<Arc<dyn MetricsCollector>>,
        root: &str,
    ) -> PackageFileMountTable {
        let table = PackageFileMountTable::new(root, Arc::clone(storage));
        match metrics {
            Some(metrics) => table.with_metrics(Arc::clone(metrics)),
            None => table,
        }
    }

    fn add_table(&self, root: &str) -> bool {
        let root = path::normalize(root);
        if root == "/" {
            return false;
        }
        let mut tables = self.tables.write().unwrap_or_else(|p| p.into_inner());
        if tables.contains_key(&root) {
            return false;
        }
        let table = Self::table(&self.storage, &self.metrics, &root);
        tables.insert(root, Arc::new(table));
        true
    }

    /// Table owning packages at `abs`.
    fn route(&self, abs: &str) -> Arc<PackageFileMountTable> {
        let tables = self.tables.read().unwrap_or_else(|p| p.into_inner());
        tables
            .iter()
            .filter(|(root, _)| path::is_within(abs, root))
            .max_by_key(|(root, _)| root.len())
            .map(|(_, table)| Arc::clone(table))
            .unwrap_or_else(|| Arc::clone(&self.root_table))
    }

    fn tables(&self) -> Vec<Arc<PackageFileMountTable>> {
        let tables = self.tables.read().unwrap_or_else(|p| p.into_inner());
        std::iter::once(Arc::clone(&self.root_table))
            .chain(tables.values().cloned())
            .collect()
    }

    fn lookup(&self, abs: &str) -> Option<(Arc<PackageFileMountTable>, InnerFileMeta)> {
        self.tables()
            .into_iter()
            .find_map(|table| table.get_mount_meta(abs).map(|meta| (table, meta)))
    }

    fn virtual_exists(&self, abs: &str) -> bool {
        self.tables().iter().any(|table| table.is_exist(abs))
    }

    /// Mount the package at `abs` into the table routed for it.
    ///
    /// Its inner paths are first checked against every other table of the
    /// tier; a path claimed elsewhere fails with `InconsistentState` and
    /// nothing is mounted.
    fn mount_package_file(&self, abs: &str) -> Result<bool> {
        let _guard = lock(&self.mounting);
        let owner = self.route(abs);
        if owner.is_mounted(abs) {
            return Ok(true);
        }
        if let Some(meta) = PackageFileMeta::load(self.storage.as_ref(), abs)? {
            let others: Vec<_> = self
                .tables()
                .into_iter()
                .filter(|table| !Arc::ptr_eq(table, &owner))
                .collect();
            for inner in meta.inner_files() {
                let inner_abs = PackageFileMeta::inner_file_path(abs, inner);
                if let Some(table) = others.iter().find(|t| conflicts(t, &inner_abs, inner.is_dir)) {
                    return Err(DirectoryError::InconsistentState(format!(
                        "inner path {} of package {} is already mounted in table {}",
                        inner_abs,
                        abs,
                        table.root()
                    )));
                }
            }
        }
        Ok(owner.mount_package_file(abs)?)
    }
}

/// True if `table` holds an entry a new entry at `abs` would collide with.
///
/// Directories merge; a file collides with any entry at or under its path
/// and with a file at one of its ancestors.
fn conflicts(table: &PackageFileMountTable, abs: &str, is_dir: bool) -> bool {
    match table.get_mount_meta(abs) {
        Some(existing) => return !(existing.is_dir && is_dir),
        None if !is_dir && table.is_exist(abs) => return true,
        None => {}
    }
    let mut ancestor = path::parent(abs);
    while let Some(dir) = ancestor {
        if matches!(table.get_mount_meta(&dir), Some(meta) if !meta.is_dir) {
            return true;
        }
        ancestor = path::parent(&dir);
    }
    false
}

enum StagedBytes {
    Snapshot(Vec<u8>),
    Shared(Arc<Mutex<Vec<u8>>>),
}

/// Bytes waiting for the next sync.
struct StagedDump {
    tier: StorageTier,
    path: String,
    bytes: StagedBytes,
    atomic: bool,
}

type WriterKey = (StorageTier, String);
type PackageWriters = HashMap<WriterKey, Arc<Mutex<PackageFileWriter>>>;

/// Sink of package writers: stores into the tier, forgets the writer on close.
struct TierSink {
    tier: Arc<Tier>,
    cache: Arc<ReaderCache>,
    writers: Arc<Mutex<PackageWriters>>,
}

impl PackageSink for TierSink {
    fn dump(&self, path: &str, data: &[u8]) -> pkgfs_package::Result<()> {
        self.tier.storage.store(path, data)?;
        self.cache.invalidate(self.tier.kind, path);
        Ok(())
    }

    fn on_close(&self, package_path: &str) {
        lock(&self.writers).remove(&(self.tier.kind, package_path.to_string()));
    }
}

/// Shared state behind every directory handle.
pub struct FileSystem {
    disk: Arc<Tier>,
    mem: Arc<Tier>,
    options: FileSystemOptions,
    package_writers: Arc<Mutex<PackageWriters>>,
    staged: Mutex<Vec<StagedDump>>,
    flushes: Mutex<Vec<JoinHandle<Result<()>>>>,
    link_shadows: Mutex<BTreeMap<String, usize>>,
    cache: Arc<ReaderCache>,
}

impl std::fmt::Debug for FileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystem")
            .field("disk", &self.disk.storage.name())
            .field("options", &self.options)
            .field("cache_entries", &self.cache.len())
            .finish()
    }
}

impl FileSystem {
    /// Create a file system over `disk`, with a fresh memory tier.
    pub fn new(disk: Arc<dyn StorageBackend>, options: FileSystemOptions) -> Arc<Self> {
        let mem: Arc<dyn StorageBackend> = Arc::new(MemStorage::new());
        Arc::new(Self {
            disk: Arc::new(Tier::new(StorageTier::Disk, disk, options.metrics.clone())),
            mem: Arc::new(Tier::new(StorageTier::Memory, mem, options.metrics.clone())),
            options,
            package_writers: Arc::new(Mutex::new(HashMap::new())),
            staged: Mutex::new(Vec::new()),
            flushes: Mutex::new(Vec::new()),
            link_shadows: Mutex::new(BTreeMap::new()),
            cache: Arc::new(ReaderCache::default()),
        })
    }

    /// File system whose disk tier lives under the host directory `root`.
    pub fn open<P: AsRef<Path>>(root: P, options: FileSystemOptions) -> Result<Arc<Self>> {
        let disk = DiskStorage::new(root)?;
        Ok(Self::new(Arc::new(disk), options))
    }

    /// File system for the configured storage root.
    pub fn from_config(config: &Config) -> Result<Arc<Self>> {
        Self::open(config.storage_root(), FileSystemOptions::from_config(config))
    }

    pub fn options(&self) -> &FileSystemOptions {
        &self.options
    }

    pub(crate) fn tier(&self, tier: StorageTier) -> &Arc<Tier> {
        match tier {
            StorageTier::Disk => &self.disk,
            StorageTier::Memory => &self.mem,
        }
    }

    /// Storage backend of a tier.
    pub fn storage(&self, tier: StorageTier) -> &Arc<dyn StorageBackend> {
        &self.tier(tier).storage
    }

    /// Add a disk mount table for packages under `root`.
    ///
    /// Returns `false` if a table already exists there.
    pub fn mount_package_storage(&self, root: &str) -> bool {
        self.disk.add_table(root)
    }

    /// Add a memory mount table for packages under `root`.
    pub fn mount_in_mem_storage(&self, root: &str) -> bool {
        self.mem.add_table(root)
    }

    /// Mount table responsible for `path` in `tier`.
    pub fn mount_table(&self, tier: StorageTier, path: &str) -> Arc<PackageFileMountTable> {
        self.tier(tier).route(&path::normalize(path))
    }

    /// Drop cached read sources no reader holds any more.
    pub fn clean_cache(&self) -> usize {
        let dropped = self.cache.clean();
        log_dir_debug!("Cleaned reader cache", dropped = dropped);
        dropped
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Blocks currently held by `cache` open-type readers.
    pub fn cached_blocks(&self) -> usize {
        self.cache.cached_blocks()
    }

    /// Number of staged dumps waiting for a sync.
    pub fn staged_count(&self) -> usize {
        lock(&self.staged).len()
    }

    /// Flush every staged dump of both tiers.
    pub fn sync(&self, wait_finish: bool) -> Result<()> {
        self.flush(StorageTier::Disk, "/", wait_finish, false)?;
        self.flush(StorageTier::Memory, "/", wait_finish, false)
    }

    // === Link shadows ===

    pub(crate) fn register_link_shadow(&self, root: &str) {
        *lock(&self.link_shadows).entry(root.to_string()).or_insert(0) += 1;
    }

    pub(crate) fn unregister_link_shadow(&self, root: &str) {
        let mut shadows = lock(&self.link_shadows);
        if let Some(count) = shadows.get_mut(root) {
            *count -= 1;
            if *count == 0 {
                shadows.remove(root);
            }
        }
    }

    /// True if a live link directory overlaps `abs`.
    pub fn is_link_shadowed(&self, abs: &str) -> bool {
        lock(&self.link_shadows)
            .keys()
            .any(|root| path::is_within(abs, root) || path::is_within(root, abs))
    }

    // === Tier operations on absolute paths ===

    pub(crate) fn is_exist(&self, tier: StorageTier, abs: &str) -> bool {
        let tier = self.tier(tier);
        tier.virtual_exists(abs) || tier.storage.exists(abs)
    }

    pub(crate) fn is_directory(&self, tier: StorageTier, abs: &str) -> bool {
        let tier = self.tier(tier);
        match tier.lookup(abs) {
            Some((_, meta)) => meta.is_dir,
            None => tier.storage.is_dir(abs) || tier.virtual_exists(abs),
        }
    }

    pub(crate) fn get_file_length(&self, tier: StorageTier, abs: &str) -> Result<u64> {
        let tier = self.tier(tier);
        match tier.lookup(abs) {
            Some((_, meta)) if meta.is_dir => Err(DirectoryError::InvalidPath(format!(
                "is a directory: {}",
                abs
            ))),
            Some((_, meta)) => Ok(meta.length),
            None if tier.virtual_exists(abs) => Err(DirectoryError::InvalidPath(format!(
                "is a directory: {}",
                abs
            ))),
            None => tier
                .storage
                .get_length(abs)
                .map_err(|e| DirectoryError::from_storage(e, abs)),
        }
    }

    pub(crate) fn list_file(
        &self,
        tier: StorageTier,
        abs: &str,
        recursive: bool,
        physical: bool,
    ) -> Result<Vec<String>> {
        let tier = self.tier(tier);
        if let Some((_, meta)) = tier.lookup(abs) {
            if !meta.is_dir {
                return Err(DirectoryError::InvalidPath(format!("not a directory: {}", abs)));
            }
        }
        let backend = match tier.storage.list_dir(abs, recursive) {
            Ok(entries) => Some(entries),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(DirectoryError::from_storage(e, abs)),
        };
        if backend.is_none() && !tier.virtual_exists(abs) {
            return Err(DirectoryError::NonExist(abs.to_string()));
        }
        if physical {
            return Ok(backend.unwrap_or_default());
        }

        let mut listing = BTreeSet::new();
        for table in tier.tables() {
            listing.extend(table.list_file(abs, recursive));
        }
        for entry in backend.into_iter().flatten() {
            if !is_package_physical_file(entry.trim_end_matches('/')) {
                listing.insert(entry);
            }
        }
        Ok(listing.into_iter().collect())
    }

    pub(crate) fn remove_file(&self, tier: StorageTier, abs: &str) -> Result<()> {
        let kind = tier;
        let tier = self.tier(tier);
        if let Some((table, meta)) = tier.lookup(abs) {
            if meta.is_dir {
                return Err(DirectoryError::InvalidPath(format!("is a directory: {}", abs)));
            }
            let location = table.physical_location(abs);
            table.remove_file(abs)?;
            if let Some((physical, _, _)) = location {
                self.cache.invalidate(kind, &physical);
            }
            return Ok(());
        }
        if tier.virtual_exists(abs) {
            return Err(DirectoryError::InvalidPath(format!("is a directory: {}", abs)));
        }
        tier.storage
            .delete_file(abs)
            .map_err(|e| DirectoryError::from_storage(e, abs))?;
        self.cache.invalidate(kind, abs);
        Ok(())
    }

    /// Remove `abs` from the mount tables and from the backend.
    ///
    /// The backend listing is taken before any table changes. If the
    /// backend deletion then fails the virtual entries are already gone;
    /// the error is returned and a retry removes what the backend kept.
    pub(crate) fn remove_directory(&self, tier: StorageTier, abs: &str) -> Result<()> {
        let kind = tier;
        let tier = self.tier(tier);
        if let Some((_, meta)) = tier.lookup(abs) {
            if !meta.is_dir {
                return Err(DirectoryError::InvalidPath(format!("not a directory: {}", abs)));
            }
        }
        if tier.storage.exists(abs) && !tier.storage.is_dir(abs) {
            return Err(DirectoryError::InvalidPath(format!("not a directory: {}", abs)));
        }
        let on_backend = tier.storage.is_dir(abs);
        let root_children = if on_backend && abs == "/" {
            tier.storage
                .list_dir("/", false)
                .map_err(|e| DirectoryError::from_storage(e, abs))?
        } else {
            Vec::new()
        };

        let mut removed = false;
        for table in tier.tables() {
            removed |= table.remove_directory(abs)?;
        }
        self.cache.invalidate_tree(kind, abs);
        self.discard_staged(kind, abs);

        if on_backend {
            let deleted = if abs == "/" {
                root_children.iter().try_for_each(|entry| {
                    let child = path::join("/", entry);
                    let outcome = if entry.ends_with('/') {
                        tier.storage.delete_dir(&child)
                    } else {
                        tier.storage.delete_file(&child)
                    };
                    match outcome {
                        Err(e) if !e.is_not_found() => Err(e),
                        _ => Ok(()),
                    }
                })
            } else {
                tier.storage.delete_dir(abs)
            };
            if let Err(e) = deleted {
                log_dir_warn!(
                    "Directory left on backend after its entries were unmounted",
                    path = abs,
                    error = e.to_string()
                );
                return Err(DirectoryError::from_storage(e, abs));
            }
            removed = true;
        }
        if !removed {
            return Err(DirectoryError::NonExist(abs.to_string()));
        }

        log_dir_debug!("Removed directory", path = abs, tier = tier.storage.name());
        Ok(())
    }

    pub(crate) fn make_dirs(&self, tier: StorageTier, abs: &str) -> Result<()> {
        let tier = self.tier(tier);
        if let Some((_, meta)) = tier.lookup(abs) {
            if !meta.is_dir {
                return Err(DirectoryError::Exist(abs.to_string()));
            }
        }
        tier.storage.mkdir(abs, true).map_err(|e| match e {
            StorageError::NotADirectory(_) => DirectoryError::Exist(abs.to_string()),
            e => DirectoryError::from_storage(e, abs),
        })
    }

    pub(crate) fn rename(&self, tier: StorageTier, src: &str, dst: &str) -> Result<()> {
        let kind = tier;
        let tier = self.tier(tier);
        if tier.virtual_exists(src) {
            return Err(DirectoryError::Unsupported(format!(
                "rename of packaged content: {}",
                src
            )));
        }
        if tier.virtual_exists(dst) {
            return Err(DirectoryError::Exist(dst.to_string()));
        }
        tier.storage.rename(src, dst).map_err(|e| match e {
            StorageError::AlreadyExists(_) => DirectoryError::Exist(dst.to_string()),
            e => DirectoryError::from_storage(e, src),
        })?;
        self.cache.invalidate_tree(kind, src);
        self.cache.invalidate_tree(kind, dst);
        Ok(())
    }

    pub(crate) fn mount_package_file(&self, tier: StorageTier, abs: &str) -> Result<bool> {
        self.tier(tier).mount_package_file(abs)
    }

    // === Package writers ===

    pub(crate) fn create_package_file_writer(
        &self,
        tier: StorageTier,
        abs: &str,
    ) -> Result<Arc<Mutex<PackageFileWriter>>> {
        let mut writers = lock(&self.package_writers);
        let key = (tier, abs.to_string());
        if let Some(writer) = writers.get(&key) {
            return Ok(Arc::clone(writer));
        }
        if self.tier(tier).route(abs).is_mounted(abs) {
            return Err(DirectoryError::Exist(abs.to_string()));
        }

        let sink = Arc::new(TierSink {
            tier: Arc::clone(self.tier(tier)),
            cache: Arc::clone(&self.cache),
            writers: Arc::clone(&self.package_writers),
        });
        let writer = Arc::new(Mutex::new(PackageFileWriter::new(
            abs,
            self.options.package_data_file_size,
            sink,
        )));
        writers.insert(key, Arc::clone(&writer));
        log_dir_debug!("Created package writer", package = abs);
        Ok(writer)
    }

    pub(crate) fn get_package_file_writer(
        &self,
        tier: StorageTier,
        abs: &str,
    ) -> Option<Arc<Mutex<PackageFileWriter>>> {
        lock(&self.package_writers)
            .get(&(tier, abs.to_string()))
            .cloned()
    }

    // === File writers ===

    pub(crate) fn create_file_writer(
        self: &Arc<Self>,
        tier: StorageTier,
        abs: &str,
        options: WriterOptions,
    ) -> Result<FileWriter> {
        if self.is_directory(tier, abs) {
            return Err(DirectoryError::InvalidPath(format!("is a directory: {}", abs)));
        }
        if self.tier(tier).lookup(abs).is_some() {
            return Err(DirectoryError::Exist(abs.to_string()));
        }
        Ok(FileWriter::new(Arc::clone(self), tier, abs.to_string(), options))
    }

    /// Called by [`FileWriter::close`].
    pub(crate) fn finish_writer(
        &self,
        tier: StorageTier,
        abs: &str,
        options: WriterOptions,
        buffer: &Arc<Mutex<Vec<u8>>>,
    ) -> Result<()> {
        if !options.is_staged() {
            let bytes = lock(buffer).clone();
            self.tier(tier)
                .storage
                .store(abs, &bytes)
                .map_err(|e| DirectoryError::from_storage(e, abs))?;
            self.cache.invalidate(tier, abs);
            return Ok(());
        }

        let bytes = if options.copy_on_dump {
            StagedBytes::Snapshot(lock(buffer).clone())
        } else {
            StagedBytes::Shared(Arc::clone(buffer))
        };
        lock(&self.staged).push(StagedDump {
            tier,
            path: abs.to_string(),
            bytes,
            atomic: options.atomic_dump,
        });
        log_dir_debug!("Staged dump", path = abs, atomic = options.atomic_dump);
        Ok(())
    }

    fn take_staged(&self, tier: StorageTier, root: &str) -> Vec<StagedDump> {
        let mut staged = lock(&self.staged);
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut *staged)
            .into_iter()
            .partition(|dump| dump.tier == tier && path::is_within(&dump.path, root));
        *staged = kept;
        taken
    }

    fn discard_staged(&self, tier: StorageTier, dir: &str) {
        lock(&self.staged).retain(|dump| !(dump.tier == tier && path::is_within(&dump.path, dir)));
    }

    /// Flush staged dumps of `tier` under `root`, mirroring the memory
    /// subtree to disk afterwards when `mirror` is set.
    ///
    /// A blocking flush first collects the outcome of earlier background
    /// flushes and reports their first error.
    pub(crate) fn flush(&self, tier: StorageTier, root: &str, wait_finish: bool, mirror: bool) -> Result<()> {
        let dumps = self.take_staged(tier, root);
        let disk = Arc::clone(&self.disk);
        let mem = Arc::clone(&self.mem);
        let cache = Arc::clone(&self.cache);
        let root = root.to_string();
        let job = move || -> Result<()> {
            let flushed = flush_dumps(&disk, &mem, dumps, &cache);
            if mirror {
                mirror_to_disk(&mem, &disk, &root, &cache)?;
            }
            flushed
        };

        if wait_finish {
            let background = self.join_background();
            let result = job();
            return background.and(result);
        }
        let handle = thread::Builder::new()
            .name("pkgfs-flush".to_string())
            .spawn(job)
            .map_err(StorageError::Io)?;
        lock(&self.flushes).push(handle);
        Ok(())
    }

    fn join_background(&self) -> Result<()> {
        let handles = std::mem::take(&mut *lock(&self.flushes));
        let mut result = Ok(());
        for handle in handles {
            let outcome = handle.join().unwrap_or_else(|_| {
                Err(DirectoryError::InconsistentState(
                    "background flush panicked".to_string(),
                ))
            });
            if let Err(e) = outcome {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    // === Readers ===

    pub(crate) fn open_reader(&self, tier: StorageTier, abs: &str, open_type: OpenType) -> Result<FileReader> {
        let requested = match open_type {
            OpenType::Auto => self.options.load.resolve(abs),
            other => other,
        };
        let tier = self.tier(tier);
        let (physical, offset, length) = match tier.lookup(abs) {
            Some((_, meta)) if meta.is_dir => {
                return Err(DirectoryError::InvalidPath(format!("is a directory: {}", abs)));
            }
            Some((table, _)) => table
                .physical_location(abs)
                .ok_or_else(|| DirectoryError::NonExist(abs.to_string()))?,
            None => {
                let length = tier
                    .storage
                    .get_length(abs)
                    .map_err(|e| DirectoryError::from_storage(e, abs))?;
                (abs.to_string(), 0, length)
            }
        };

        let (effective, source) = match requested {
            OpenType::Mmap => match self.mmap_source(tier, &physical)? {
                Some(source) => (OpenType::Mmap, source),
                None => (OpenType::InMem, self.memory_source(tier, &physical)?),
            },
            OpenType::Cache => (OpenType::Cache, self.block_source(tier, &physical)?),
            OpenType::Buffered => (
                OpenType::Buffered,
                ReadSource::Buffered {
                    storage: Arc::clone(&tier.storage),
                    path: physical.clone(),
                },
            ),
            OpenType::InMem | OpenType::Auto => (OpenType::InMem, self.memory_source(tier, &physical)?),
        };
        log_dir_debug!(
            "Opened reader",
            path = abs,
            physical = physical.as_str(),
            open_type = effective.to_string()
        );
        Ok(FileReader::new(
            abs.to_string(),
            physical,
            effective,
            offset,
            length,
            source,
        ))
    }

    fn memory_source(&self, tier: &Tier, physical: &str) -> Result<ReadSource> {
        if let Some(source) = self.cache.get(tier.kind, physical, CacheKind::Memory) {
            return Ok(source);
        }
        let data = tier
            .storage
            .atomic_load(physical)
            .map_err(|e| DirectoryError::from_storage(e, physical))?;
        Ok(self.cache.insert(
            tier.kind,
            physical,
            CacheKind::Memory,
            ReadSource::Memory(Arc::new(data)),
        ))
    }

    fn mmap_source(&self, tier: &Tier, physical: &str) -> Result<Option<ReadSource>> {
        if let Some(source) = self.cache.get(tier.kind, physical, CacheKind::Mmap) {
            return Ok(Some(source));
        }
        let Some(local) = tier.storage.local_path(physical) else {
            return Ok(None);
        };
        let file = File::open(&local)
            .map_err(|e| DirectoryError::from_storage(StorageError::Io(e), physical))?;
        if file.metadata().map_err(StorageError::Io)?.len() == 0 {
            return Ok(None);
        }
        // SAFETY: storage replaces files by rename and never truncates them in place.
        let map = unsafe { Mmap::map(&file) }.map_err(StorageError::Io)?;
        Ok(Some(self.cache.insert(
            tier.kind,
            physical,
            CacheKind::Mmap,
            ReadSource::Mmap(Arc::new(map)),
        )))
    }

    fn block_source(&self, tier: &Tier, physical: &str) -> Result<ReadSource> {
        if let Some(source) = self.cache.get(tier.kind, physical, CacheKind::Blocks) {
            return Ok(source);
        }
        let file_len = tier
            .storage
            .get_length(physical)
            .map_err(|e| DirectoryError::from_storage(e, physical))?;
        let blocks = BlockCache::new(Arc::clone(&tier.storage), physical.to_string(), file_len);
        Ok(self.cache.insert(
            tier.kind,
            physical,
            CacheKind::Blocks,
            ReadSource::Blocks(Arc::new(blocks)),
        ))
    }
}

/// Store staged dumps; every dump is attempted, the first error is returned.
fn flush_dumps(disk: &Tier, mem: &Tier, dumps: Vec<StagedDump>, cache: &ReaderCache) -> Result<()> {
    let mut first_error = None;
    for dump in dumps {
        let tier = match dump.tier {
            StorageTier::Disk => disk,
            StorageTier::Memory => mem,
        };
        let bytes = match dump.bytes {
            StagedBytes::Snapshot(bytes) => bytes,
            StagedBytes::Shared(buffer) => lock(&buffer).clone(),
        };
        let stored = if dump.atomic {
            tier.storage.atomic_store(&dump.path, &bytes)
        } else {
            tier.storage.store(&dump.path, &bytes)
        };
        cache.invalidate(tier.kind, &dump.path);
        if let Err(e) = stored {
            log_dir_warn!(
                "Failed to flush staged file",
                path = dump.path.as_str(),
                error = e.to_string()
            );
            first_error.get_or_insert(DirectoryError::from_storage(e, &dump.path));
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Copy the memory subtree at `root` to the same path on disk and mount the
/// packages it contains there.
///
/// Inner files and directories the memory tier no longer has are then
/// removed from the disk view, so both tiers list the same entries.
fn mirror_to_disk(mem: &Tier, disk: &Tier, root: &str, cache: &ReaderCache) -> Result<()> {
    let mut packages = BTreeSet::new();
    let mut copied = 0;
    if mem.storage.is_dir(root) {
        disk.storage.mkdir(root, true)?;
        for entry in mem.storage.list_dir(root, true)? {
            let abs = path::join(root, &entry);
            copied += 1;
            if entry.ends_with('/') {
                disk.storage.mkdir(&abs, true)?;
                continue;
            }
            let bytes = mem.storage.atomic_load(&abs)?;
            disk.storage.store(&abs, &bytes)?;
            cache.invalidate(disk.kind, &abs);
            if let Some(package) = package_path_of_meta(&abs) {
                packages.insert(package.to_string());
            }
        }
        for package in &packages {
            disk.mount_package_file(package)?;
        }
    }

    // Packages released from memory since an earlier mirror
    for table in disk.tables() {
        packages.extend(
            table
                .mounted_packages()
                .into_iter()
                .filter(|p| path::is_within(p, root) && !mem.storage.exists(&package_file_meta_path(p))),
        );
    }
    let mut dropped = 0;
    for package in &packages {
        dropped += drop_removed_entries(mem, disk, package, cache)?;
    }
    log_dir_debug!(
        "Mirrored memory subtree to disk",
        root = root,
        entries = copied,
        packages = packages.len(),
        dropped = dropped
    );
    Ok(())
}

/// Remove from the disk view the entries of a mirrored package that are gone
/// from the memory view. Returns the number of removed entries.
///
/// A package present in memory storage but not mounted there is left as is.
fn drop_removed_entries(mem: &Tier, disk: &Tier, package: &str, cache: &ReaderCache) -> Result<usize> {
    if mem.storage.exists(&package_file_meta_path(package)) && !mem.route(package).is_mounted(package) {
        return Ok(0);
    }
    let table = disk.route(package);
    if !table.is_mounted(package) {
        return Ok(0);
    }
    let Some(meta) = PackageFileMeta::load(disk.storage.as_ref(), package)? else {
        return Ok(0);
    };

    let mut dropped = 0;
    for inner in meta.inner_files() {
        let abs = PackageFileMeta::inner_file_path(package, inner);
        let removed = if inner.is_dir {
            !mem.virtual_exists(&abs) && table.remove_directory(&abs)?
        } else {
            mem.lookup(&abs).is_none() && table.remove_file(&abs)?
        };
        if removed {
            dropped += 1;
        }
    }
    if dropped > 0 {
        for idx in 0..meta.physical_files.len() {
            if let Some(data_path) = meta.physical_file_path(package, idx) {
                cache.invalidate(disk.kind, &data_path);
            }
        }
        log_dir_debug!("Dropped removed entries from disk mirror", package = package, dropped = dropped);
    }
    Ok(dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn fs() -> Arc<FileSystem> {
        FileSystem::new(Arc::new(MemStorage::new()), FileSystemOptions::default())
    }

    /// Memory backend whose next `delete_dir` fails.
    #[derive(Debug, Default)]
    struct FailingDeleteDir {
        inner: MemStorage,
        fail_next: AtomicBool,
    }

    impl StorageBackend for FailingDeleteDir {
        fn exists(&self, path: &str) -> bool {
            self.inner.exists(path)
        }
        fn is_dir(&self, path: &str) -> bool {
            self.inner.is_dir(path)
        }
        fn mkdir(&self, path: &str, recursive: bool) -> pkgfs_storage::Result<()> {
            self.inner.mkdir(path, recursive)
        }
        fn store(&self, path: &str, data: &[u8]) -> pkgfs_storage::Result<()> {
            self.inner.store(path, data)
        }
        fn atomic_store(&self, path: &str, data: &[u8]) -> pkgfs_storage::Result<()> {
            self.inner.atomic_store(path, data)
        }
        fn atomic_load(&self, path: &str) -> pkgfs_storage::Result<Vec<u8>> {
            self.inner.atomic_load(path)
        }
        fn rename(&self, from: &str, to: &str) -> pkgfs_storage::Result<()> {
            self.inner.rename(from, to)
        }
        fn get_length(&self, path: &str) -> pkgfs_storage::Result<u64> {
            self.inner.get_length(path)
        }
        fn list_dir(&self, path: &str, recursive: bool) -> pkgfs_storage::Result<Vec<String>> {
            self.inner.list_dir(path, recursive)
        }
        fn delete_file(&self, path: &str) -> pkgfs_storage::Result<()> {
            self.inner.delete_file(path)
        }
        fn delete_dir(&self, path: &str) -> pkgfs_storage::Result<()> {
            if self.fail_next.swap(false, Ordering::AcqRel) {
                return Err(StorageError::Io(std::io::Error::other("injected")));
            }
            self.inner.delete_dir(path)
        }
        fn name(&self) -> &'static str {
            "failing"
        }
    }

    #[test]
    fn test_routing_prefers_longest_root() {
        let fs = fs();
        assert!(fs.mount_package_storage("/part_0"));
        assert!(!fs.mount_package_storage("/part_0/"));
        assert!(fs.mount_package_storage("/part_0/seg_1"));

        assert_eq!(fs.mount_table(StorageTier::Disk, "/part_0/seg_1/p").root(), "/part_0/seg_1");
        assert_eq!(fs.mount_table(StorageTier::Disk, "/part_0/seg_2/p").root(), "/part_0");
        assert_eq!(fs.mount_table(StorageTier::Disk, "/part_01").root(), "/");
        assert_eq!(fs.mount_table(StorageTier::Memory, "/part_0/x").root(), "/");
    }

    #[test]
    fn test_link_shadow_counting() {
        let fs = fs();
        fs.register_link_shadow("/seg");
        fs.register_link_shadow("/seg");
        assert!(fs.is_link_shadowed("/seg/index"));
        assert!(fs.is_link_shadowed("/"));
        assert!(!fs.is_link_shadowed("/segment"));

        fs.unregister_link_shadow("/seg");
        assert!(fs.is_link_shadowed("/seg"));
        fs.unregister_link_shadow("/seg");
        assert!(!fs.is_link_shadowed("/seg"));
    }

    #[test]
    fn test_staged_dumps_partition_by_root() {
        let fs = fs();
        let buffer = Arc::new(Mutex::new(b"x".to_vec()));
        let staged = WriterOptions::default().with_copy_on_dump();
        fs.finish_writer(StorageTier::Disk, "/a/f", staged, &buffer).unwrap();
        fs.finish_writer(StorageTier::Disk, "/b/f", staged, &buffer).unwrap();
        fs.finish_writer(StorageTier::Memory, "/a/g", staged, &buffer).unwrap();
        assert_eq!(fs.staged_count(), 3);

        fs.flush(StorageTier::Disk, "/a", true, false).unwrap();
        assert_eq!(fs.staged_count(), 2);
        assert!(fs.storage(StorageTier::Disk).exists("/a/f"));
        assert!(!fs.storage(StorageTier::Disk).exists("/b/f"));

        fs.sync(true).unwrap();
        assert_eq!(fs.staged_count(), 0);
        assert!(fs.storage(StorageTier::Memory).exists("/a/g"));
    }

    #[test]
    fn test_remove_directory_backend_failure_is_retryable() {
        let backend = Arc::new(FailingDeleteDir::default());
        let fs = FileSystem::new(backend.clone(), FileSystemOptions::default());
        let sink = Arc::new(pkgfs_package::StorageSink::new(backend.clone()));
        let mut writer = PackageFileWriter::new("/seg/pkg", 0, sink);
        writer.create_inner_file_writer("dir/a").unwrap().write(b"a").unwrap();
        writer.close().unwrap();
        backend.store("/seg/dir/loose", b"l").unwrap();
        assert!(fs.mount_package_file(StorageTier::Disk, "/seg/pkg").unwrap());

        backend.fail_next.store(true, Ordering::Release);
        assert!(matches!(
            fs.remove_directory(StorageTier::Disk, "/seg/dir"),
            Err(DirectoryError::Storage(_))
        ));
        // Entries are unmounted, the backend copy survives
        assert!(fs.tier(StorageTier::Disk).lookup("/seg/dir/a").is_none());
        assert!(backend.exists("/seg/dir/loose"));

        fs.remove_directory(StorageTier::Disk, "/seg/dir").unwrap();
        assert!(!fs.is_exist(StorageTier::Disk, "/seg/dir"));
        assert!(!backend.exists("/seg/pkg.__meta__"));
    }
}
