//! Registry of directory factories.
//!
//! [`DirectoryCreator::global`] is created on first use with the built-in
//! factories and lives for the rest of the process. Tests that register
//! their own factories should call [`DirectoryCreator::reset`] afterwards,
//! or use a private instance from [`DirectoryCreator::new`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

use crate::directory::{DirectoryKind, DirectoryPtr};
use crate::fs::FileSystem;
use crate::in_mem::InMemDirectory;
use crate::link::LinkDirectory;
use crate::local::LocalDirectory;
use crate::{DirectoryError, Result};

/// Builds directories of one kind.
pub trait DirectoryFactory: Send + Sync {
    fn create(&self, fs: Arc<FileSystem>, root: &str) -> Result<DirectoryPtr>;
}

struct LocalFactory;

impl DirectoryFactory for LocalFactory {
    fn create(&self, fs: Arc<FileSystem>, root: &str) -> Result<DirectoryPtr> {
        Ok(Arc::new(LocalDirectory::new(fs, root)))
    }
}

struct InMemFactory;

impl DirectoryFactory for InMemFactory {
    fn create(&self, fs: Arc<FileSystem>, root: &str) -> Result<DirectoryPtr> {
        Ok(Arc::new(InMemDirectory::new(fs, root)))
    }
}

struct LinkFactory;

impl DirectoryFactory for LinkFactory {
    fn create(&self, fs: Arc<FileSystem>, root: &str) -> Result<DirectoryPtr> {
        Ok(Arc::new(LinkDirectory::new(fs, root)?))
    }
}

static GLOBAL: Lazy<DirectoryCreator> = Lazy::new(DirectoryCreator::new);

/// Maps a [`DirectoryKind`] to the factory that builds it.
pub struct DirectoryCreator {
    factories: RwLock<HashMap<DirectoryKind, Arc<dyn DirectoryFactory>>>,
}

impl fmt::Debug for DirectoryCreator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let factories = self.factories.read().unwrap_or_else(|p| p.into_inner());
        let mut kinds: Vec<String> = factories.keys().map(|k| k.to_string()).collect();
        kinds.sort();
        f.debug_struct("DirectoryCreator")
            .field("kinds", &kinds)
            .finish()
    }
}

impl Default for DirectoryCreator {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectoryCreator {
    /// Creator with the built-in factories.
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(Self::builtin()),
        }
    }

    /// Creator without any factory.
    pub fn empty() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// Process-wide creator.
    pub fn global() -> &'static DirectoryCreator {
        &GLOBAL
    }

    fn builtin() -> HashMap<DirectoryKind, Arc<dyn DirectoryFactory>> {
        let mut factories: HashMap<DirectoryKind, Arc<dyn DirectoryFactory>> = HashMap::new();
        factories.insert(DirectoryKind::Local, Arc::new(LocalFactory));
        factories.insert(DirectoryKind::InMemory, Arc::new(InMemFactory));
        factories.insert(DirectoryKind::Link, Arc::new(LinkFactory));
        factories
    }

    /// Register `factory` for `kind`, returning the factory it replaces.
    pub fn register(
        &self,
        kind: DirectoryKind,
        factory: Arc<dyn DirectoryFactory>,
    ) -> Option<Arc<dyn DirectoryFactory>> {
        self.factories
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(kind, factory)
    }

    pub fn create(&self, kind: DirectoryKind) -> Result<Arc<dyn DirectoryFactory>> {
        self.factories
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&kind)
            .cloned()
            .ok_or_else(|| DirectoryError::Unsupported(format!("no factory for {} directories", kind)))
    }

    /// Restore the built-in factories.
    pub fn reset(&self) {
        *self.factories.write().unwrap_or_else(|p| p.into_inner()) = Self::builtin();
    }

    pub fn create_directory(
        &self,
        kind: DirectoryKind,
        fs: Arc<FileSystem>,
        root: &str,
    ) -> Result<DirectoryPtr> {
        self.create(kind)?.create(fs, root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FileSystemOptions;
    use pkgfs_storage::MemStorage;

    fn fs() -> Arc<FileSystem> {
        FileSystem::new(Arc::new(MemStorage::new()), FileSystemOptions::default())
    }

    struct CountingFactory(std::sync::atomic::AtomicUsize);

    impl DirectoryFactory for CountingFactory {
        fn create(&self, fs: Arc<FileSystem>, root: &str) -> Result<DirectoryPtr> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(Arc::new(InMemDirectory::new(fs, root)))
        }
    }

    #[test]
    fn test_builtin_kinds() {
        let creator = DirectoryCreator::new();
        let fs = fs();
        let local = creator.create_directory(DirectoryKind::Local, fs.clone(), "/a").unwrap();
        assert_eq!(local.kind(), DirectoryKind::Local);
        assert_eq!(local.root(), "/a");
        let mem = creator.create_directory(DirectoryKind::InMemory, fs.clone(), "/b/").unwrap();
        assert_eq!(mem.kind(), DirectoryKind::InMemory);
        assert_eq!(mem.root(), "/b");
        // The disk root always exists
        let link = creator.create_directory(DirectoryKind::Link, fs.clone(), "/").unwrap();
        assert_eq!(link.kind(), DirectoryKind::Link);
        assert!(matches!(
            creator.create_directory(DirectoryKind::Link, fs, "/missing"),
            Err(DirectoryError::NonExist(_))
        ));
    }

    #[test]
    fn test_register_and_reset() {
        let creator = DirectoryCreator::empty();
        assert!(matches!(
            creator.create(DirectoryKind::Local),
            Err(DirectoryError::Unsupported(_))
        ));

        let counting = Arc::new(CountingFactory(Default::default()));
        assert!(creator.register(DirectoryKind::Local, counting.clone()).is_none());
        let dir = creator.create_directory(DirectoryKind::Local, fs(), "/x").unwrap();
        assert_eq!(dir.kind(), DirectoryKind::InMemory);
        assert_eq!(counting.0.load(std::sync::atomic::Ordering::SeqCst), 1);

        creator.reset();
        let dir = creator.create_directory(DirectoryKind::Local, fs(), "/x").unwrap();
        assert_eq!(dir.kind(), DirectoryKind::Local);
        assert_eq!(counting.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_global_has_builtins() {
        assert!(DirectoryCreator::global().create(DirectoryKind::InMemory).is_ok());
    }
}
