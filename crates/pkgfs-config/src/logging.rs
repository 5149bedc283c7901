//! Structured logging utilities for pkgfs components.
//!
//! Provides consistent logging with component prefixes and structured fields.
//!
//! # Usage
//!
//! ```ignore
//! use pkgfs_config::log_mount_info;
//!
//! log_mount_info!("Mounted package", package = "/seg/package_file", files = 12);
//! ```

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const MOUNT: &'static str = "MOUNT";
    pub const DIRECTORY: &'static str = "DIRECTORY";
    pub const PACKAGE: &'static str = "PACKAGE";
    pub const STORAGE: &'static str = "STORAGE";
    pub const CLI: &'static str = "CLI";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

// === MOUNT logging macros ===

#[macro_export]
macro_rules! log_mount_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "MOUNT", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_mount_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "MOUNT", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_mount_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "MOUNT", $($key = $value,)* $msg)
    };
}

// === DIRECTORY logging macros ===

#[macro_export]
macro_rules! log_dir_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "DIRECTORY", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_dir_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "DIRECTORY", $($key = $value,)* $msg)
    };
}

// === PACKAGE logging macros ===

#[macro_export]
macro_rules! log_package_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "PACKAGE", $($key = $value,)* $msg)
    };
}

// === CLI logging macros ===

#[macro_export]
macro_rules! log_cli_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "CLI", $($key = $value,)* $msg)
    };
}

/// Initialize logging with the given level filter.
/// Call this once at application startup. `PKGFS_LOG` and `RUST_LOG`
/// take precedence over `level`.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let filter = match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    };

    let env_filter = EnvFilter::try_from_env("PKGFS_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_constants() {
        assert_eq!(Component::MOUNT, "MOUNT");
        assert_eq!(Component::DIRECTORY, "DIRECTORY");
        assert_eq!(Component::PACKAGE, "PACKAGE");
    }

    #[test]
    fn test_macros_expand() {
        log_mount_debug!("mount check", package = "/seg/p", files = 3usize);
        log_dir_warn!("dir check", path = "/seg");
        log_package_debug!("package check");
    }

    #[test]
    fn test_init_logging_twice_is_harmless() {
        init_logging(LogLevel::Warn);
        init_logging(LogLevel::Debug);
    }
}
