//! Package writer: collects inner files, then lays them out into data files.

use std::collections::{BTreeSet, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use pkgfs_config::log_package_debug;
use pkgfs_storage::{path, StorageBackend};

use crate::meta::{InnerFileMeta, PackageFileMeta};
use crate::naming::{package_file_data_path, package_file_meta_path};
use crate::{PackageError, Result};

/// Destination of a closing package's physical files.
pub trait PackageSink: Send + Sync {
    /// Persist one physical file (data or meta) at `path`.
    fn dump(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Called once after every physical file of the package was dumped.
    fn on_close(&self, _package_path: &str) {}
}

/// Sink writing straight into a storage backend.
#[derive(Debug, Clone)]
pub struct StorageSink {
    storage: Arc<dyn StorageBackend>,
}

impl StorageSink {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }
}

impl PackageSink for StorageSink {
    fn dump(&self, path: &str, data: &[u8]) -> Result<()> {
        self.storage.store(path, data)?;
        Ok(())
    }
}

fn lock(buffer: &Mutex<Vec<u8>>) -> MutexGuard<'_, Vec<u8>> {
    buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Writer for one inner file of an open package.
///
/// Bytes are buffered until the owning package is closed.
#[derive(Debug, Clone)]
pub struct InnerFileWriter {
    package_path: String,
    path: String,
    buffer: Arc<Mutex<Vec<u8>>>,
    closed: Arc<AtomicBool>,
}

impl InnerFileWriter {
    /// Relative path of the inner file.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn write(&self, data: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PackageError::Closed(self.package_path.clone()));
        }
        lock(&self.buffer).extend_from_slice(data);
        Ok(())
    }

    pub fn len(&self) -> usize {
        lock(&self.buffer).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl io::Write for InnerFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        InnerFileWriter::write(self, buf).map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Builder for one package.
///
/// Open until [`close`](Self::close); every call afterwards fails with
/// [`PackageError::Closed`].
pub struct PackageFileWriter {
    package_path: String,
    data_tag: String,
    data_file_size: u64,
    sink: Arc<dyn PackageSink>,
    files: Vec<InnerFileWriter>,
    file_paths: HashSet<String>,
    dirs: BTreeSet<String>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for PackageFileWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageFileWriter")
            .field("package_path", &self.package_path)
            .field("files", &self.files.len())
            .field("dirs", &self.dirs.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PackageFileWriter {
    /// Create a writer for the package at `package_path`.
    ///
    /// `data_file_size` caps each data file (0 = unlimited); a single inner
    /// file larger than the cap still gets a data file of its own.
    pub fn new(package_path: &str, data_file_size: u64, sink: Arc<dyn PackageSink>) -> Self {
        Self {
            package_path: path::normalize(package_path),
            data_tag: String::new(),
            data_file_size,
            sink,
            files: Vec::new(),
            file_paths: HashSet::new(),
            dirs: BTreeSet::new(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Tag inserted into data file names (`<name>.__data__<tag>N`).
    pub fn with_data_tag(mut self, tag: impl Into<String>) -> Self {
        self.data_tag = tag.into();
        self
    }

    pub fn package_path(&self) -> &str {
        &self.package_path
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn inner_file_count(&self) -> usize {
        self.files.len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(PackageError::Closed(self.package_path.clone()));
        }
        Ok(())
    }

    fn relative(&self, rel: &str) -> Result<String> {
        let normalized = path::normalize(rel);
        if normalized == "/" {
            return Err(PackageError::Invalid(format!(
                "Empty inner path in package {}",
                self.package_path
            )));
        }
        Ok(normalized.trim_start_matches('/').to_string())
    }

    fn duplicate(&self, rel: &str) -> PackageError {
        PackageError::Duplicate {
            package: self.package_path.clone(),
            path: rel.to_string(),
        }
    }

    /// Record `rel` and its ancestors as directories.
    fn add_dirs(&mut self, rel: &str) -> Result<()> {
        let mut chain = Vec::new();
        let mut current = Some(path::normalize(rel));
        while let Some(dir) = current {
            if dir == "/" {
                break;
            }
            let relative = dir.trim_start_matches('/').to_string();
            if self.file_paths.contains(&relative) {
                return Err(self.duplicate(&relative));
            }
            current = path::parent(&dir);
            chain.push(relative);
        }
        self.dirs.extend(chain);
        Ok(())
    }

    /// Start a new inner file at `rel` (relative to the package directory).
    pub fn create_inner_file_writer(&mut self, rel: &str) -> Result<InnerFileWriter> {
        self.ensure_open()?;
        let rel = self.relative(rel)?;
        if self.file_paths.contains(&rel) || self.dirs.contains(&rel) {
            return Err(self.duplicate(&rel));
        }
        if let Some(parent) = path::parent(&format!("/{}", rel)) {
            self.add_dirs(&parent)?;
        }

        let writer = InnerFileWriter {
            package_path: self.package_path.clone(),
            path: rel.clone(),
            buffer: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::clone(&self.closed),
        };
        self.file_paths.insert(rel);
        self.files.push(writer.clone());
        Ok(writer)
    }

    /// Record an (possibly empty) inner directory.
    pub fn make_inner_dir(&mut self, rel: &str) -> Result<()> {
        self.ensure_open()?;
        let rel = self.relative(rel)?;
        self.add_dirs(&rel)
    }

    /// Lay out inner files, dump data and meta files, and close the writer.
    pub fn close(&mut self) -> Result<PackageFileMeta> {
        self.ensure_open()?;
        let file_name = path::file_name(&self.package_path).to_string();
        let mut meta = PackageFileMeta::new(self.data_tag.clone());

        for dir in &self.dirs {
            meta.add_inner_file(InnerFileMeta::directory(dir.clone()));
        }

        let mut data_files: Vec<Vec<u8>> = Vec::new();
        let mut current: Vec<u8> = Vec::new();
        for file in &self.files {
            let bytes = lock(&file.buffer);
            let len = bytes.len() as u64;
            if self.data_file_size > 0
                && !current.is_empty()
                && current.len() as u64 + len > self.data_file_size
            {
                data_files.push(std::mem::take(&mut current));
            }
            meta.add_inner_file(InnerFileMeta::file(
                file.path.clone(),
                current.len() as u64,
                len,
                data_files.len(),
            ));
            current.extend_from_slice(&bytes);
        }
        data_files.push(current);

        for (idx, data) in data_files.iter().enumerate() {
            let data_path = package_file_data_path(&self.package_path, &self.data_tag, idx);
            self.sink.dump(&data_path, data)?;
            meta.add_physical_file(path::file_name(&data_path), data.len() as u64);
        }
        let json = meta.to_json()?;
        self.sink
            .dump(&package_file_meta_path(&self.package_path), json.as_bytes())?;

        self.closed.store(true, Ordering::Release);
        log_package_debug!(
            "Closed package",
            package = self.package_path.as_str(),
            name = file_name.as_str(),
            files = self.files.len(),
            data_files = data_files.len()
        );
        self.sink.on_close(&self.package_path);
        Ok(meta)
    }

    /// Close without dumping anything; buffered inner files are dropped.
    pub fn abort(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.closed.store(true, Ordering::Release);
        self.files.clear();
        self.file_paths.clear();
        self.dirs.clear();
        log_package_debug!("Aborted package", package = self.package_path.as_str());
        self.sink.on_close(&self.package_path);
        Ok(())
    }
}
