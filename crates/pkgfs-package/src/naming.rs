//! Physical file naming for packages.

/// Suffix of the meta file.
pub const META_SUFFIX: &str = ".__meta__";
/// Marker between the package name and the data file tag + index.
pub const DATA_SUFFIX: &str = ".__data__";

/// Virtual path of the meta file of `package_path`.
pub fn package_file_meta_path(package_path: &str) -> String {
    format!("{}{}", package_path, META_SUFFIX)
}

/// Virtual path of data file `physical_idx` of `package_path`.
///
/// `tag` is empty for ordinary packages, giving `<name>.__data__0`.
pub fn package_file_data_path(package_path: &str, tag: &str, physical_idx: usize) -> String {
    format!("{}{}{}{}", package_path, DATA_SUFFIX, tag, physical_idx)
}

/// Package path owning a meta file path, if it is one.
pub fn package_path_of_meta(meta_path: &str) -> Option<&str> {
    meta_path
        .strip_suffix(META_SUFFIX)
        .filter(|p| !p.is_empty() && !p.ends_with('/'))
}

/// True if `name` (a file name or path) is a package meta or data file.
pub fn is_package_physical_file(name: &str) -> bool {
    let name = name.rsplit('/').next().unwrap_or(name);
    if name.ends_with(META_SUFFIX) {
        return name.len() > META_SUFFIX.len();
    }
    match name.rfind(DATA_SUFFIX) {
        Some(idx) if idx > 0 => {
            let rest = &name[idx + DATA_SUFFIX.len()..];
            rest.chars().last().is_some_and(|c| c.is_ascii_digit())
        }
        _ => false,
    }
}
