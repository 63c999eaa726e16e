use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

/// Relative path components always joined with `/`, independent of platform separator.
pub fn to_rel_string(path: &Path) -> String {
    let mut out = String::new();
    for (i, c) in path.components().enumerate() {
        if i > 0 {
            out.push('/');
        }
        out.push_str(&c.as_os_str().to_string_lossy());
    }
    out
}

pub fn depth(rel_path: &str) -> usize {
    if rel_path.is_empty() {
        0
    } else {
        rel_path.matches('/').count() + 1
    }
}

pub fn parent(rel_path: &str) -> String {
    match rel_path.rfind('/') {
        Some(idx) => rel_path[..idx].to_string(),
        None => String::new(),
    }
}

pub fn basename(rel_path: &str) -> &str {
    match rel_path.rfind('/') {
        Some(idx) => &rel_path[idx + 1..],
        None => rel_path,
    }
}

pub fn join_rel(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

/// Sorts a list of directory relative-paths deepest first, so leaves are
/// processed before their ancestors during push.
pub fn sort_deepest_first(paths: &mut [String]) {
    paths.sort_by(|a, b| depth(b).cmp(&depth(a)).then_with(|| a.cmp(b)));
}

/// Sorts a list of relative-paths shallowest first, so a parent directory is
/// always created before any child path inside it is written.
pub fn sort_shallowest_first(paths: &mut [String]) {
    paths.sort_by(|a, b| depth(a).cmp(&depth(b)).then_with(|| a.cmp(b)));
}

pub fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn expand_tilde(path: &Path) -> PathBuf {
    let mut components = path.components();
    match components.next() {
        Some(Component::Normal(c)) if c == OsStr::new("~") => {
            let mut out = home_dir();
            for c in components {
                out.push(c.as_os_str());
            }
            out
        }
        _ => path.to_path_buf(),
    }
}

pub fn clean_lexical(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Path::new(&std::path::MAIN_SEPARATOR.to_string())),
            Component::CurDir => {}
            Component::ParentDir => {
                if !pop_normal_component(&mut out) && !out.as_os_str().is_empty() {
                    out.push("..");
                }
            }
            Component::Normal(p) => out.push(p),
        }
    }
    if out.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        out
    }
}

fn pop_normal_component(path: &mut PathBuf) -> bool {
    let mut comps = path.components().collect::<Vec<_>>();
    match comps.pop() {
        Some(Component::Normal(_)) => {
            *path = rebuild_components(&comps);
            true
        }
        Some(Component::Prefix(_)) | Some(Component::RootDir) | None => false,
        Some(Component::CurDir) => {
            *path = rebuild_components(&comps);
            false
        }
        Some(Component::ParentDir) => {
            *path = rebuild_components(&comps);
            false
        }
    }
}

fn rebuild_components(components: &[Component<'_>]) -> PathBuf {
    let mut out = PathBuf::new();
    for c in components {
        match c {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Path::new(&std::path::MAIN_SEPARATOR.to_string())),
            Component::CurDir => {}
            Component::ParentDir => out.push(".."),
            Component::Normal(p) => out.push(p),
        }
    }
    out
}

pub fn absolutize_path(path: &Path) -> PathBuf {
    let expanded = expand_tilde(path);
    let abs = if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(expanded)
    };
    let cleaned = clean_lexical(&abs);
    std::fs::canonicalize(&cleaned).unwrap_or(cleaned)
}

/// True if `prefix` names a path that is `path` or an ancestor of it, using
/// `/`-joined relative path comparisons (not filesystem prefix matching).
pub fn is_under(path: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    path == prefix || path.starts_with(&format!("{prefix}/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_counts_separators() {
        assert_eq!(depth(""), 0);
        assert_eq!(depth("a"), 1);
        assert_eq!(depth("a/b"), 2);
        assert_eq!(depth("a/b/c"), 3);
    }

    #[test]
    fn parent_and_basename() {
        assert_eq!(parent("a/b/c"), "a/b");
        assert_eq!(parent("a"), "");
        assert_eq!(basename("a/b/c"), "c");
        assert_eq!(basename("a"), "a");
    }

    #[test]
    fn sort_deepest_first_orders_leaves_before_root() {
        let mut paths = vec!["a".to_string(), "a/b/c".to_string(), "".to_string(), "a/b".to_string()];
        sort_deepest_first(&mut paths);
        assert_eq!(paths, vec!["a/b/c", "a/b", "a", ""]);
    }

    #[test]
    fn sort_shallowest_first_orders_root_before_leaves() {
        let mut paths = vec!["a/b/c".to_string(), "".to_string(), "a".to_string()];
        sort_shallowest_first(&mut paths);
        assert_eq!(paths, vec!["", "a", "a/b/c"]);
    }

    #[test]
    fn is_under_matches_prefix_and_self() {
        assert!(is_under("build/out.js", "build"));
        assert!(is_under("build", "build"));
        assert!(!is_under("buildx/out.js", "build"));
        assert!(is_under("anything", ""));
    }
}
