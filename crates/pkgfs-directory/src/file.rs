//! File readers, file writers and the reader cache.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use memmap2::Mmap;

use pkgfs_config::OpenType;
use pkgfs_storage::{checked_range_end, path, StorageBackend};

use crate::fs::{FileSystem, StorageTier};
use crate::{DirectoryError, Result};

/// Block size of the `cache` open type.
pub const CACHE_BLOCK_SIZE: usize = 4096;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// How a file writer hands its bytes to storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterOptions {
    /// Stage the bytes at close and promote them at sync, failing the sync
    /// with `Exist` if the target was written in between.
    pub atomic_dump: bool,
    /// Snapshot the shared buffer at close instead of reading it at sync.
    pub copy_on_dump: bool,
}

impl WriterOptions {
    pub fn atomic() -> Self {
        Self {
            atomic_dump: true,
            copy_on_dump: false,
        }
    }

    pub fn with_copy_on_dump(mut self) -> Self {
        self.copy_on_dump = true;
        self
    }

    /// True if bytes wait for a sync instead of being stored at close.
    pub(crate) fn is_staged(&self) -> bool {
        self.atomic_dump || self.copy_on_dump
    }
}

/// Writer for one loose file.
///
/// Bytes accumulate in a shared buffer until [`close`](Self::close).
#[derive(Debug)]
pub struct FileWriter {
    fs: Arc<FileSystem>,
    tier: StorageTier,
    path: String,
    options: WriterOptions,
    buffer: Arc<Mutex<Vec<u8>>>,
    closed: bool,
}

impl FileWriter {
    pub(crate) fn new(fs: Arc<FileSystem>, tier: StorageTier, path: String, options: WriterOptions) -> Self {
        Self {
            fs,
            tier,
            path,
            options,
            buffer: Arc::new(Mutex::new(Vec::new())),
            closed: false,
        }
    }

    /// Absolute virtual path being written.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn options(&self) -> WriterOptions {
        self.options
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(DirectoryError::InconsistentState(format!(
                "write after close: {}",
                self.path
            )));
        }
        lock(&self.buffer).extend_from_slice(data);
        Ok(())
    }

    /// The buffer holding the written bytes.
    ///
    /// Without `copy_on_dump`, changes made here after close are what a
    /// later sync stores.
    pub fn shared_buffer(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.buffer)
    }

    pub fn len(&self) -> usize {
        lock(&self.buffer).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store the file, or stage it for the next sync. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.fs
            .finish_writer(self.tier, &self.path, self.options, &self.buffer)
    }
}

impl io::Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        FileWriter::write(self, buf).map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Fixed-size block cache over one physical file.
#[derive(Debug)]
pub(crate) struct BlockCache {
    storage: Arc<dyn StorageBackend>,
    path: String,
    file_len: u64,
    blocks: DashMap<u64, Arc<Vec<u8>>>,
}

impl BlockCache {
    pub(crate) fn new(storage: Arc<dyn StorageBackend>, path: String, file_len: u64) -> Self {
        Self {
            storage,
            path,
            file_len,
            blocks: DashMap::new(),
        }
    }

    fn block(&self, idx: u64) -> Result<Arc<Vec<u8>>> {
        if let Some(block) = self.blocks.get(&idx) {
            return Ok(Arc::clone(block.value()));
        }
        let start = idx * CACHE_BLOCK_SIZE as u64;
        let len = self.file_len.saturating_sub(start).min(CACHE_BLOCK_SIZE as u64) as usize;
        let data = Arc::new(self.storage.read_range(&self.path, start, len)?);
        self.blocks.insert(idx, Arc::clone(&data));
        Ok(data)
    }

    pub(crate) fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let end = checked_range_end(&self.path, offset, len, self.file_len)?;
        let block_size = CACHE_BLOCK_SIZE as u64;
        let mut out = Vec::with_capacity(len);
        let mut pos = offset;
        while pos < end {
            let idx = pos / block_size;
            let block = self.block(idx)?;
            let within = (pos - idx * block_size) as usize;
            let take = ((end - pos) as usize).min(block.len().saturating_sub(within));
            if take == 0 {
                return Err(DirectoryError::InconsistentState(format!(
                    "short block {} of {}",
                    idx, self.path
                )));
            }
            out.extend_from_slice(&block[within..within + take]);
            pos += take as u64;
        }
        Ok(out)
    }

    pub(crate) fn cached_blocks(&self) -> usize {
        self.blocks.len()
    }
}

/// Where a reader's bytes come from.
#[derive(Debug, Clone)]
pub(crate) enum ReadSource {
    Memory(Arc<Vec<u8>>),
    Mmap(Arc<Mmap>),
    Blocks(Arc<BlockCache>),
    Buffered {
        storage: Arc<dyn StorageBackend>,
        path: String,
    },
}

impl ReadSource {
    /// True while a reader other than the cache still holds the source.
    fn in_use(&self) -> bool {
        match self {
            ReadSource::Memory(data) => Arc::strong_count(data) > 1,
            ReadSource::Mmap(map) => Arc::strong_count(map) > 1,
            ReadSource::Blocks(cache) => Arc::strong_count(cache) > 1,
            ReadSource::Buffered { .. } => false,
        }
    }
}

fn slice(data: &[u8], offset: u64, len: usize, path: &str) -> Result<Vec<u8>> {
    let end = checked_range_end(path, offset, len, data.len() as u64)? as usize;
    Ok(data[offset as usize..end].to_vec())
}

/// Reader for one file, packaged or loose.
///
/// Packaged files read a `[offset, offset + len)` window of their data file.
pub struct FileReader {
    path: String,
    physical_path: String,
    open_type: OpenType,
    offset: u64,
    length: u64,
    source: ReadSource,
}

impl std::fmt::Debug for FileReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileReader")
            .field("path", &self.path)
            .field("physical_path", &self.physical_path)
            .field("open_type", &self.open_type)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .finish()
    }
}

impl FileReader {
    pub(crate) fn new(
        path: String,
        physical_path: String,
        open_type: OpenType,
        offset: u64,
        length: u64,
        source: ReadSource,
    ) -> Self {
        Self {
            path,
            physical_path,
            open_type,
            offset,
            length,
            source,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Physical file holding the bytes (the data file for packaged files).
    pub fn physical_path(&self) -> &str {
        &self.physical_path
    }

    /// Open type actually used (`mmap` falls back to `in_mem` off disk).
    pub fn open_type(&self) -> OpenType {
        self.open_type
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Read `len` bytes at `pos` within the file.
    pub fn read(&self, pos: u64, len: usize) -> Result<Vec<u8>> {
        checked_range_end(&self.path, pos, len, self.length)?;
        let offset = self.offset + pos;
        match &self.source {
            ReadSource::Memory(data) => slice(data, offset, len, &self.physical_path),
            ReadSource::Mmap(map) => slice(map, offset, len, &self.physical_path),
            ReadSource::Blocks(cache) => cache.read(offset, len),
            ReadSource::Buffered { storage, path } => Ok(storage.read_range(path, offset, len)?),
        }
    }

    pub fn read_all(&self) -> Result<Vec<u8>> {
        self.read(0, self.length as usize)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum CacheKind {
    Memory,
    Mmap,
    Blocks,
}

type CacheKey = (StorageTier, String, CacheKind);

/// Shared read sources keyed by physical file.
#[derive(Debug, Default)]
pub(crate) struct ReaderCache {
    entries: DashMap<CacheKey, ReadSource>,
}

impl ReaderCache {
    pub(crate) fn get(&self, tier: StorageTier, path: &str, kind: CacheKind) -> Option<ReadSource> {
        self.entries
            .get(&(tier, path.to_string(), kind))
            .map(|entry| entry.value().clone())
    }

    pub(crate) fn insert(&self, tier: StorageTier, path: &str, kind: CacheKind, source: ReadSource) -> ReadSource {
        self.entries
            .insert((tier, path.to_string(), kind), source.clone());
        source
    }

    /// Forget every source of one physical file.
    pub(crate) fn invalidate(&self, tier: StorageTier, path: &str) {
        for kind in [CacheKind::Memory, CacheKind::Mmap, CacheKind::Blocks] {
            self.entries.remove(&(tier, path.to_string(), kind));
        }
    }

    /// Forget every source at or under `dir`.
    pub(crate) fn invalidate_tree(&self, tier: StorageTier, dir: &str) {
        self.entries
            .retain(|(t, p, _), _| !(*t == tier && path::is_within(p, dir)));
    }

    /// Drop sources no reader holds any more; returns how many were dropped.
    pub(crate) fn clean(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, source| source.in_use());
        before.saturating_sub(self.entries.len())
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn cached_blocks(&self) -> usize {
        self.entries
            .iter()
            .map(|entry| match entry.value() {
                ReadSource::Blocks(cache) => cache.cached_blocks(),
                _ => 0,
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkgfs_storage::MemStorage;

    fn blocks(data: &[u8]) -> BlockCache {
        let storage = Arc::new(MemStorage::new());
        storage.store("/blob", data).unwrap();
        BlockCache::new(storage, "/blob".to_string(), data.len() as u64)
    }

    #[test]
    fn test_block_cache_reads_across_blocks() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let cache = blocks(&data);

        let read = cache.read(4000, 300).unwrap();
        assert_eq!(read, &data[4000..4300]);
        assert_eq!(cache.cached_blocks(), 1 + 1);

        let tail = cache.read(9000, 1000).unwrap();
        assert_eq!(tail, &data[9000..]);
        assert!(cache.read(9999, 2).is_err());
        assert!(cache.read(u64::MAX, 1).is_err());
    }

    #[test]
    fn test_block_cache_empty_read() {
        let cache = blocks(b"");
        assert!(cache.read(0, 0).unwrap().is_empty());
        assert_eq!(cache.cached_blocks(), 0);
    }

    #[test]
    fn test_reader_cache_clean_keeps_held_sources() {
        let cache = ReaderCache::default();
        let held = cache.insert(
            StorageTier::Disk,
            "/a",
            CacheKind::Memory,
            ReadSource::Memory(Arc::new(vec![1])),
        );
        cache.insert(
            StorageTier::Disk,
            "/b",
            CacheKind::Memory,
            ReadSource::Memory(Arc::new(vec![2])),
        );

        assert_eq!(cache.clean(), 1);
        assert_eq!(cache.len(), 1);
        drop(held);
        assert_eq!(cache.clean(), 1);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_reader_cache_invalidate_tree() {
        let cache = ReaderCache::default();
        for p in ["/seg/a", "/seg/x/b", "/segment/c"] {
            cache.insert(
                StorageTier::Memory,
                p,
                CacheKind::Memory,
                ReadSource::Memory(Arc::new(Vec::new())),
            );
        }
        cache.invalidate_tree(StorageTier::Memory, "/seg");
        assert_eq!(cache.len(), 1);
        assert!(cache
            .get(StorageTier::Memory, "/segment/c", CacheKind::Memory)
            .is_some());
    }

    #[test]
    fn test_writer_options() {
        assert!(!WriterOptions::default().is_staged());
        assert!(WriterOptions::atomic().is_staged());
        let copy = WriterOptions::default().with_copy_on_dump();
        assert!(copy.is_staged());
        assert!(!copy.atomic_dump);
    }
}
