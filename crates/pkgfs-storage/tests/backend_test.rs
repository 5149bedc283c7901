//! Behavior shared by every storage backend.

use pkgfs_storage::{DiskStorage, MemStorage, StorageBackend, StorageError};
use tempfile::TempDir;

fn backends() -> (TempDir, Vec<Box<dyn StorageBackend>>) {
    let temp = TempDir::new().unwrap();
    let disk = DiskStorage::new(temp.path().join("disk")).unwrap();
    let backends: Vec<Box<dyn StorageBackend>> = vec![Box::new(disk), Box::new(MemStorage::new())];
    (temp, backends)
}

#[test]
fn test_store_load_and_length() {
    let (_temp, backends) = backends();
    for backend in &backends {
        backend.store("/seg/index/file", b"hello").unwrap();
        assert!(backend.exists("/seg/index/file"), "{}", backend.name());
        assert!(backend.is_dir("/seg/index"), "{}", backend.name());
        assert_eq!(backend.atomic_load("/seg/index/file").unwrap(), b"hello");
        assert_eq!(backend.get_length("/seg/index/file").unwrap(), 5);

        backend.store("/seg/index/file", b"hi").unwrap();
        assert_eq!(backend.atomic_load("/seg/index/file").unwrap(), b"hi");
    }
}

#[test]
fn test_atomic_store_rejects_existing() {
    let (_temp, backends) = backends();
    for backend in &backends {
        backend.atomic_store("/version.0", b"v0").unwrap();
        let err = backend.atomic_store("/version.0", b"v1").unwrap_err();
        assert!(
            matches!(err, StorageError::AlreadyExists(_)),
            "{}: {err}",
            backend.name()
        );
        assert_eq!(backend.atomic_load("/version.0").unwrap(), b"v0");
    }
}

#[test]
fn test_listing_format_matches() {
    let (_temp, backends) = backends();
    for backend in &backends {
        backend.store("/seg/a", b"a").unwrap();
        backend.store("/seg/sub/b", b"b").unwrap();
        backend.mkdir("/seg/empty", false).unwrap();

        assert_eq!(
            backend.list_dir("/seg", false).unwrap(),
            vec!["a", "empty/", "sub/"],
            "{}",
            backend.name()
        );
        assert_eq!(
            backend.list_dir("/seg", true).unwrap(),
            vec!["a", "empty/", "sub/", "sub/b"],
            "{}",
            backend.name()
        );
    }
}

#[test]
fn test_missing_paths_report_not_found() {
    let (_temp, backends) = backends();
    for backend in &backends {
        assert!(backend.atomic_load("/nope").unwrap_err().is_not_found());
        assert!(backend.list_dir("/nope", false).unwrap_err().is_not_found());
        assert!(backend.delete_file("/nope").unwrap_err().is_not_found());
        assert!(backend.delete_dir("/nope").unwrap_err().is_not_found());
        assert!(backend.get_length("/nope").unwrap_err().is_not_found());
    }
}

#[test]
fn test_rename_and_delete() {
    let (_temp, backends) = backends();
    for backend in &backends {
        backend.store("/tmp/seg/data", b"123").unwrap();
        backend.store("/final/taken", b"x").unwrap();

        assert!(matches!(
            backend.rename("/tmp/seg", "/final/taken"),
            Err(StorageError::AlreadyExists(_))
        ));
        backend.rename("/tmp/seg", "/final/seg").unwrap();
        assert!(!backend.exists("/tmp/seg"));
        assert_eq!(backend.atomic_load("/final/seg/data").unwrap(), b"123");

        backend.delete_file("/final/taken").unwrap();
        backend.delete_dir("/final").unwrap();
        assert!(!backend.exists("/final/seg/data"));
    }
}

#[test]
fn test_read_range() {
    let (_temp, backends) = backends();
    for backend in &backends {
        backend.store("/blob", b"0123456789").unwrap();
        assert_eq!(backend.read_range("/blob", 0, 3).unwrap(), b"012");
        assert_eq!(backend.read_range("/blob", 7, 3).unwrap(), b"789");
        assert_eq!(backend.read_range("/blob", 10, 0).unwrap(), b"");
        assert!(matches!(
            backend.read_range("/blob", 9, 2),
            Err(StorageError::OutOfRange { .. })
        ));
        assert!(matches!(
            backend.read_range("/blob", u64::MAX, 1),
            Err(StorageError::OutOfRange { .. })
        ));
    }
}

#[test]
fn test_local_path_only_on_disk() {
    let (temp, backends) = backends();
    assert_eq!(
        backends[0].local_path("/a/b"),
        Some(temp.path().join("disk").join("a/b"))
    );
    assert_eq!(backends[1].local_path("/a/b"), None);
}
