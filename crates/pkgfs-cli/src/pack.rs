//! # Packing
//!
//! Turns a host directory into one package file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Args;
use walkdir::WalkDir;

use pkgfs_config::log_cli_info;
use pkgfs_directory::Directory;
use pkgfs_package::{PackageFileMeta, PackageFileWriter};

#[derive(Args, Debug)]
pub struct PackArgs {
    /// Host directory to pack
    #[arg(value_name = "SRC")]
    pub source: PathBuf,

    /// Virtual path of the package (e.g. /segment_0/package_file)
    #[arg(value_name = "PACKAGE")]
    pub package: String,

    /// Mount the package right after writing it
    #[arg(long)]
    pub mount: bool,
}

/// Pack every file and directory under `source` into package `name` of `dir`.
///
/// Inner paths are relative to `source`; empty directories are kept. On
/// failure the package writer is aborted and nothing is written.
pub fn pack_directory(dir: &dyn Directory, name: &str, source: &Path) -> Result<PackageFileMeta> {
    if !source.is_dir() {
        bail!("not a directory: {}", source.display());
    }
    let writer = dir
        .create_package_file_writer(name)
        .with_context(|| format!("cannot create package {}", name))?;
    let mut writer = writer
        .lock()
        .map_err(|_| anyhow::anyhow!("package writer for {} is poisoned", name))?;

    if let Err(e) = add_tree(&mut writer, source) {
        writer.abort()?;
        return Err(e);
    }
    Ok(writer.close()?)
}

fn add_tree(writer: &mut PackageFileWriter, source: &Path) -> Result<()> {
    for entry in WalkDir::new(source).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let rel = inner_path(source, entry.path())?;
        if entry.file_type().is_dir() {
            writer.make_inner_dir(&rel)?;
        } else if entry.file_type().is_file() {
            let data = fs::read(entry.path())
                .with_context(|| format!("cannot read {}", entry.path().display()))?;
            writer.create_inner_file_writer(&rel)?.write(&data)?;
        }
    }
    Ok(())
}

/// `/`-separated path of `path` below `source`.
fn inner_path(source: &Path, path: &Path) -> Result<String> {
    let rel = path
        .strip_prefix(source)
        .with_context(|| format!("{} is outside {}", path.display(), source.display()))?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

pub fn run(dir: &dyn Directory, name: &str, args: &PackArgs) -> Result<()> {
    let meta = pack_directory(dir, name, &args.source)?;
    let stats = meta.stats();
    log_cli_info!(
        "Packed directory",
        package = args.package.as_str(),
        files = stats.file_count,
        bytes = stats.payload_bytes
    );

    println!();
    println!("  Packed {}", args.source.display());
    println!("    Package:        {}", args.package);
    println!("    Files:          {}", stats.file_count);
    println!("    Directories:    {}", stats.dir_count);
    println!("    Payload bytes:  {}", stats.payload_bytes);
    println!("    Data files:     {}", stats.physical_file_count);

    if args.mount {
        dir.mount_package_file(name)?;
        println!("    Mounted:        yes");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkgfs_config::testing::TestEnvironment;
    use pkgfs_directory::{FileSystem, FileSystemOptions, LocalDirectory, OpenType};

    #[test]
    fn test_inner_path_uses_forward_slashes() {
        let source = Path::new("/tmp/src");
        assert_eq!(inner_path(source, &source.join("a").join("b.txt")).unwrap(), "a/b.txt");
        assert!(inner_path(source, Path::new("/elsewhere")).is_err());
    }

    #[test]
    fn test_pack_directory_round_trip() {
        let env = TestEnvironment::new().unwrap();
        env.create_file("src/file1", b"abcd").unwrap();
        env.create_file("src/index/file2", b"12345").unwrap();
        env.create_dir("src/empty").unwrap();

        let fs = FileSystem::open(&env.storage_root, FileSystemOptions::default()).unwrap();
        let dir = LocalDirectory::new(fs, "/seg");
        let meta = pack_directory(&dir, "package_file", &env.scratch_root.join("src")).unwrap();
        let stats = meta.stats();
        assert_eq!(stats.file_count, 2);
        assert_eq!(stats.dir_count, 2);
        assert_eq!(stats.payload_bytes, 9);

        assert!(dir.mount_package_file("package_file").unwrap());
        assert_eq!(dir.list_file("", false, false).unwrap(), vec!["empty/", "file1", "index/"]);
        let reader = dir.create_file_reader("index/file2", OpenType::InMem).unwrap();
        assert_eq!(reader.read_all().unwrap(), b"12345");
    }

    #[test]
    fn test_failed_pack_releases_writer() {
        let env = TestEnvironment::new().unwrap();
        env.create_file("src/file1", b"abcd").unwrap();
        let fs = FileSystem::open(&env.storage_root, FileSystemOptions::default()).unwrap();
        let dir = LocalDirectory::new(fs, "/seg");

        // An in-flight writer for the same package already holds file1
        let writer = dir.create_package_file_writer("package_file").unwrap();
        writer.lock().unwrap().create_inner_file_writer("file1").unwrap();

        assert!(pack_directory(&dir, "package_file", &env.scratch_root.join("src")).is_err());
        assert!(dir.get_package_file_writer("package_file").is_none());
        assert!(!dir.is_exist("package_file.__meta__"));

        let meta = pack_directory(&dir, "package_file", &env.scratch_root.join("src")).unwrap();
        assert_eq!(meta.stats().file_count, 1);
    }

    #[test]
    fn test_pack_rejects_missing_source() {
        let env = TestEnvironment::new().unwrap();
        let fs = FileSystem::open(&env.storage_root, FileSystemOptions::default()).unwrap();
        let dir = LocalDirectory::new(fs, "/seg");
        assert!(pack_directory(&dir, "p", &env.scratch_root.join("missing")).is_err());
    }
}
