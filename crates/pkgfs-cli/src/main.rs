//! # pkgfs CLI
//!
//! Command-line interface for packing, listing and removing files stored
//! in pkgfs package files.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use pkgfs_config::{init_logging, log_cli_info, Config};
use pkgfs_directory::{
    Directory, FileSystem, FileSystemOptions, LocalDirectory, StorageTier,
};
use pkgfs_package::{package_path_of_meta, PackageFileMeta};
use pkgfs_storage::path;

mod pack;

/// pkgfs - many small files in a few package files
#[derive(Parser)]
#[command(name = "pkgfs")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Storage root directory (overrides the configured one)
    #[arg(long, env = "PKGFS_ROOT")]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pack a host directory into a package file
    Pack(pack::PackArgs),

    /// List a directory with every package inside it mounted
    Ls {
        /// Virtual directory to list
        #[arg(value_name = "DIR", default_value = "/")]
        directory: String,

        /// Descend into subdirectories
        #[arg(short, long)]
        recursive: bool,

        /// Show physical files (meta and data files) instead of inner files
        #[arg(long)]
        physical: bool,
    },

    /// Print the meta of a package
    Inspect {
        /// Virtual path of the package
        #[arg(value_name = "PACKAGE")]
        package: String,

        /// Print the raw JSON meta
        #[arg(long)]
        json: bool,
    },

    /// Remove a virtual file or directory
    Rm {
        /// Virtual path to remove
        #[arg(value_name = "PATH")]
        path: String,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Show config file locations
    Path,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("warning: ignoring invalid configuration: {}", e);
            Config::default()
        }
    };
    if let Some(root) = cli.root {
        config.storage.root = root;
    }
    init_logging(config.logging.log_level());

    match cli.command {
        Commands::Config { command } => cmd_config(&config, command),
        Commands::Pack(args) => {
            let fs = open_file_system(&config)?;
            let package = path::normalize(&args.package);
            let parent = path::parent(&package).context("package path must name a file")?;
            let dir = LocalDirectory::new(fs, &parent);
            pack::run(&dir, path::file_name(&package), &args)
        }
        Commands::Ls {
            directory,
            recursive,
            physical,
        } => cmd_ls(&config, &directory, recursive, physical),
        Commands::Inspect { package, json } => cmd_inspect(&config, &package, json),
        Commands::Rm { path } => cmd_rm(&config, &path),
    }
}

fn open_file_system(config: &Config) -> Result<std::sync::Arc<FileSystem>> {
    let root = config.storage_root();
    FileSystem::open(&root, FileSystemOptions::from_config(config))
        .with_context(|| format!("cannot open storage root {}", root.display()))
}

/// Mount every package whose meta file sits in `dir` (or below it when
/// `recursive`). Returns the number of mounted packages.
fn mount_packages(dir: &dyn Directory, recursive: bool) -> Result<usize> {
    let mut mounted = 0;
    for entry in dir.list_file("", recursive, true)? {
        if let Some(package) = package_path_of_meta(&entry) {
            if dir
                .mount_package_file(package)
                .with_context(|| format!("cannot mount {}", path::join(dir.root(), package)))?
            {
                mounted += 1;
            }
        }
    }
    Ok(mounted)
}

fn cmd_ls(config: &Config, directory: &str, recursive: bool, physical: bool) -> Result<()> {
    let fs = open_file_system(config)?;
    let dir = LocalDirectory::new(fs, directory);
    let mounted = mount_packages(&dir, recursive)?;
    log_cli_info!("Mounted packages", dir = dir.root(), packages = mounted);

    for entry in dir.list_file("", recursive, physical)? {
        println!("{}", entry);
    }
    Ok(())
}

fn cmd_inspect(config: &Config, package: &str, json: bool) -> Result<()> {
    let fs = open_file_system(config)?;
    let package = path::normalize(package);
    let Some(meta) = PackageFileMeta::load(fs.storage(StorageTier::Disk).as_ref(), &package)? else {
        bail!("no package at {}", package);
    };

    if json {
        println!("{}", meta.to_json()?);
        return Ok(());
    }

    let stats = meta.stats();
    println!();
    println!("  Package {}", package);
    println!("    Files:          {}", stats.file_count);
    println!("    Directories:    {}", stats.dir_count);
    println!("    Payload bytes:  {}", stats.payload_bytes);
    println!("    Data files:     {}", stats.physical_file_count);
    for name in meta.physical_file_names() {
        println!("      {}", name);
    }
    println!();
    for inner in meta.inner_files() {
        if inner.is_dir {
            println!("  {}/", inner.path);
        } else {
            println!(
                "  {}  [data {} @ {}, {} bytes]",
                inner.path, inner.physical_file_index, inner.offset, inner.length
            );
        }
    }
    Ok(())
}

fn cmd_rm(config: &Config, target: &str) -> Result<()> {
    let fs = open_file_system(config)?;
    let target = path::normalize(target);
    if target == "/" {
        bail!("refusing to remove the storage root");
    }

    // Packages owning the target live in one of its ancestors.
    let mut ancestor = path::parent(&target);
    while let Some(dir) = ancestor {
        let local = LocalDirectory::new(fs.clone(), &dir);
        if local.is_exist("") {
            mount_packages(&local, false)?;
        }
        ancestor = path::parent(&dir);
    }

    let root = LocalDirectory::new(fs, "/");
    if let Some(dir) = root.get_directory(&target, false)? {
        mount_packages(&*dir, true)?;
        root.remove_directory(&target)?;
    } else {
        root.remove_file(&target)?;
    }
    log_cli_info!("Removed path", path = target.as_str());
    println!("Removed {}", target);
    Ok(())
}

fn cmd_config(config: &Config, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            print!("{}", toml::to_string_pretty(config)?);
        }
        ConfigCommands::Path => {
            match Config::global_config_path() {
                Some(global) => println!("Global:  {}", global.display()),
                None => println!("Global:  (no home directory)"),
            }
            println!("Project: {}", Config::project_config_path().display());
        }
    }
    Ok(())
}
