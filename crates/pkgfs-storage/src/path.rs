//! Virtual path helpers.
//!
//! Virtual paths are `/`-separated strings. Normalized absolute paths start
//! with `/` and never end with `/` unless they are the root itself.

/// Normalize a path: leading `/`, no empty or `.` components, `..` pops.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

/// Join `relative` under `base` and normalize the result.
pub fn join(base: &str, relative: &str) -> String {
    normalize(&format!("{}/{}", base, relative))
}

/// Parent of a normalized path; `None` for the root.
pub fn parent(path: &str) -> Option<String> {
    let path = normalize(path);
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(idx) => Some(path[..idx].to_string()),
        None => None,
    }
}

/// Last component of a path (empty for the root).
pub fn file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// `path` relative to `dir` when `dir` is a strict ancestor of `path`.
///
/// Both arguments must already be normalized.
pub fn relative_to<'a>(path: &'a str, dir: &str) -> Option<&'a str> {
    if dir == "/" {
        return path.strip_prefix('/').filter(|rest| !rest.is_empty());
    }
    path.strip_prefix(dir)
        .and_then(|rest| rest.strip_prefix('/'))
        .filter(|rest| !rest.is_empty())
}

/// True if `dir` is a strict ancestor of `path` (both normalized).
pub fn is_ancestor(dir: &str, path: &str) -> bool {
    relative_to(path, dir).is_some()
}

/// True if `path` equals `dir` or lies under it (both normalized).
pub fn is_within(path: &str, dir: &str) -> bool {
    path == dir || is_ancestor(dir, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(""), "/");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("a/b/"), "/a/b");
        assert_eq!(normalize("//a//./b"), "/a/b");
        assert_eq!(normalize("/a/../b"), "/b");
        assert_eq!(normalize("/../.."), "/");
    }

    #[test]
    fn test_join_and_parent() {
        assert_eq!(join("/seg", "index/file"), "/seg/index/file");
        assert_eq!(join("/", "file"), "/file");
        assert_eq!(join("/seg", ""), "/seg");
        assert_eq!(parent("/seg/index"), Some("/seg".to_string()));
        assert_eq!(parent("/seg"), Some("/".to_string()));
        assert_eq!(parent("/"), None);
    }

    #[test]
    fn test_file_name() {
        assert_eq!(file_name("/seg/index/"), "index");
        assert_eq!(file_name("/seg/package_file.__meta__"), "package_file.__meta__");
        assert_eq!(file_name("file"), "file");
    }

    #[test]
    fn test_relative_to() {
        assert_eq!(relative_to("/seg/index/f", "/seg"), Some("index/f"));
        assert_eq!(relative_to("/seg", "/seg"), None);
        assert_eq!(relative_to("/segment", "/seg"), None);
        assert_eq!(relative_to("/seg", "/"), Some("seg"));
        assert!(is_ancestor("/", "/a"));
        assert!(!is_ancestor("/a", "/ab"));
        assert!(is_within("/a", "/a"));
    }
}
