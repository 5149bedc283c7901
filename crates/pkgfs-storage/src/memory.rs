//! In-memory storage backend.
//!
//! Backs the buffered tier and tests. All data is lost when dropped.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::path::{normalize, parent, relative_to};
use crate::{checked_range_end, Result, StorageBackend, StorageError};

/// Node in the memory tree.
#[derive(Debug, Clone)]
enum Node {
    File(Arc<Vec<u8>>),
    Directory,
}

/// In-memory storage keyed by normalized virtual path.
///
/// Thread-safe via internal `RwLock`. The root directory always exists.
#[derive(Debug)]
pub struct MemStorage {
    nodes: RwLock<BTreeMap<String, Node>>,
}

impl Default for MemStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::Directory);
        Self {
            nodes: RwLock::new(nodes),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Node>> {
        self.nodes.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Node>> {
        self.nodes.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Shared handle to a file's bytes without copying.
    pub fn load_shared(&self, path: &str) -> Result<Arc<Vec<u8>>> {
        let path = normalize(path);
        match self.read().get(&path) {
            Some(Node::File(data)) => Ok(Arc::clone(data)),
            Some(Node::Directory) => Err(StorageError::IsADirectory(path)),
            None => Err(StorageError::NotFound(path)),
        }
    }

    /// Number of files currently stored.
    pub fn file_count(&self) -> usize {
        self.read()
            .values()
            .filter(|n| matches!(n, Node::File(_)))
            .count()
    }

    /// Keys strictly under `dir`, in order.
    fn descendants(nodes: &BTreeMap<String, Node>, dir: &str) -> Vec<String> {
        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{}/", dir)
        };
        nodes
            .range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| k.as_str() != dir)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Create every missing ancestor directory of `path`.
    fn ensure_parents(nodes: &mut BTreeMap<String, Node>, path: &str) -> Result<()> {
        let mut ancestors = Vec::new();
        let mut current = parent(path);
        while let Some(dir) = current {
            current = parent(&dir);
            ancestors.push(dir);
        }
        for dir in ancestors.into_iter().rev() {
            match nodes.get(&dir) {
                Some(Node::Directory) => {}
                Some(Node::File(_)) => return Err(StorageError::NotADirectory(dir)),
                None => {
                    nodes.insert(dir, Node::Directory);
                }
            }
        }
        Ok(())
    }
}

impl StorageBackend for MemStorage {
    fn exists(&self, path: &str) -> bool {
        self.read().contains_key(&normalize(path))
    }

    fn is_dir(&self, path: &str) -> bool {
        matches!(self.read().get(&normalize(path)), Some(Node::Directory))
    }

    fn mkdir(&self, path: &str, recursive: bool) -> Result<()> {
        let path = normalize(path);
        let mut nodes = self.write();
        match nodes.get(&path) {
            Some(Node::Directory) => return Ok(()),
            Some(Node::File(_)) => return Err(StorageError::NotADirectory(path)),
            None => {}
        }
        if recursive {
            Self::ensure_parents(&mut nodes, &path)?;
        } else if let Some(p) = parent(&path) {
            match nodes.get(&p) {
                Some(Node::Directory) => {}
                Some(Node::File(_)) => return Err(StorageError::NotADirectory(p)),
                None => return Err(StorageError::NotFound(p)),
            }
        }
        nodes.insert(path, Node::Directory);
        Ok(())
    }

    fn store(&self, path: &str, data: &[u8]) -> Result<()> {
        let path = normalize(path);
        let mut nodes = self.write();
        if let Some(Node::Directory) = nodes.get(&path) {
            return Err(StorageError::IsADirectory(path));
        }
        Self::ensure_parents(&mut nodes, &path)?;
        nodes.insert(path, Node::File(Arc::new(data.to_vec())));
        Ok(())
    }

    fn atomic_store(&self, path: &str, data: &[u8]) -> Result<()> {
        let path = normalize(path);
        let mut nodes = self.write();
        if nodes.contains_key(&path) {
            return Err(StorageError::AlreadyExists(path));
        }
        Self::ensure_parents(&mut nodes, &path)?;
        nodes.insert(path, Node::File(Arc::new(data.to_vec())));
        Ok(())
    }

    fn atomic_load(&self, path: &str) -> Result<Vec<u8>> {
        self.load_shared(path).map(|data| data.as_ref().clone())
    }

    fn read_range(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        let data = self.load_shared(path)?;
        let end = checked_range_end(&normalize(path), offset, len, data.len() as u64)? as usize;
        Ok(data[offset as usize..end].to_vec())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = normalize(from);
        let to = normalize(to);
        let mut nodes = self.write();
        let node = match nodes.get(&from) {
            Some(node) => node.clone(),
            None => return Err(StorageError::NotFound(from)),
        };
        if nodes.contains_key(&to) {
            return Err(StorageError::AlreadyExists(to));
        }
        Self::ensure_parents(&mut nodes, &to)?;

        for key in Self::descendants(&nodes, &from) {
            if let (Some(child), Some(rel)) = (nodes.remove(&key), relative_to(&key, &from)) {
                nodes.insert(format!("{}/{}", to, rel), child);
            }
        }
        nodes.remove(&from);
        nodes.insert(to, node);
        Ok(())
    }

    fn get_length(&self, path: &str) -> Result<u64> {
        self.load_shared(path).map(|data| data.len() as u64)
    }

    fn list_dir(&self, path: &str, recursive: bool) -> Result<Vec<String>> {
        let path = normalize(path);
        let nodes = self.read();
        match nodes.get(&path) {
            Some(Node::Directory) => {}
            Some(Node::File(_)) => return Err(StorageError::NotADirectory(path)),
            None => return Err(StorageError::NotFound(path)),
        }

        let mut entries = Vec::new();
        for key in Self::descendants(&nodes, &path) {
            let Some(rel) = relative_to(&key, &path) else {
                continue;
            };
            if !recursive && rel.contains('/') {
                continue;
            }
            match nodes.get(&key) {
                Some(Node::Directory) => entries.push(format!("{}/", rel)),
                Some(Node::File(_)) => entries.push(rel.to_string()),
                None => {}
            }
        }
        entries.sort();
        Ok(entries)
    }

    fn delete_file(&self, path: &str) -> Result<()> {
        let path = normalize(path);
        let mut nodes = self.write();
        match nodes.get(&path) {
            Some(Node::File(_)) => {
                nodes.remove(&path);
                Ok(())
            }
            Some(Node::Directory) => Err(StorageError::IsADirectory(path)),
            None => Err(StorageError::NotFound(path)),
        }
    }

    fn delete_dir(&self, path: &str) -> Result<()> {
        let path = normalize(path);
        let mut nodes = self.write();
        match nodes.get(&path) {
            Some(Node::Directory) => {}
            Some(Node::File(_)) => return Err(StorageError::NotADirectory(path)),
            None => return Err(StorageError::NotFound(path)),
        }
        for key in Self::descendants(&nodes, &path) {
            nodes.remove(&key);
        }
        // The root itself is never removed
        if path != "/" {
            nodes.remove(&path);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_creates_parents() {
        let mem = MemStorage::new();
        mem.store("/seg/index/file", b"abc").unwrap();
        assert!(mem.is_dir("/seg"));
        assert!(mem.is_dir("/seg/index"));
        assert_eq!(mem.get_length("/seg/index/file").unwrap(), 3);
    }

    #[test]
    fn test_list_dir_marks_directories() {
        let mem = MemStorage::new();
        mem.store("/seg/a", b"a").unwrap();
        mem.store("/seg/index/b", b"b").unwrap();

        assert_eq!(mem.list_dir("/seg", false).unwrap(), vec!["a", "index/"]);
        assert_eq!(
            mem.list_dir("/seg", true).unwrap(),
            vec!["a", "index/", "index/b"]
        );
        assert_eq!(mem.list_dir("/", false).unwrap(), vec!["seg/"]);
    }

    #[test]
    fn test_list_dir_ignores_sibling_prefixes() {
        let mem = MemStorage::new();
        mem.store("/seg/a", b"a").unwrap();
        mem.store("/segment/b", b"b").unwrap();
        assert_eq!(mem.list_dir("/seg", true).unwrap(), vec!["a"]);
    }

    #[test]
    fn test_rename_moves_subtree() {
        let mem = MemStorage::new();
        mem.store("/tmp/seg/a", b"a").unwrap();
        mem.store("/tmp/seg/x/b", b"b").unwrap();
        mem.rename("/tmp/seg", "/final/seg").unwrap();

        assert!(!mem.exists("/tmp/seg"));
        assert_eq!(mem.atomic_load("/final/seg/x/b").unwrap(), b"b");
        assert!(mem.is_dir("/final/seg/x"));
    }

    #[test]
    fn test_delete_root_keeps_root() {
        let mem = MemStorage::new();
        mem.store("/a/b", b"b").unwrap();
        mem.delete_dir("/").unwrap();
        assert!(mem.is_dir("/"));
        assert_eq!(mem.file_count(), 0);
    }

    #[test]
    fn test_mkdir_non_recursive_requires_parent() {
        let mem = MemStorage::new();
        assert!(matches!(
            mem.mkdir("/a/b", false),
            Err(StorageError::NotFound(_))
        ));
        mem.mkdir("/a/b", true).unwrap();
        mem.mkdir("/a/b/c", false).unwrap();
        assert!(mem.is_dir("/a/b/c"));
    }
}
