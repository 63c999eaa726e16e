use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};

pub const DEFAULT_EXCLUDE_PATTERNS: &[&str] = &[
    ".git",
    ".pushwork",
    "node_modules",
    "*.tmp",
    "**/.*.tmp-*",
    ".DS_Store",
    "__pycache__/",
    ".venv/",
];

#[derive(Clone)]
pub struct SyncFilters {
    root: PathBuf,
    matcher: Gitignore,
}

impl SyncFilters {
    pub fn load(root: &Path, exclude_patterns: &[String]) -> Result<Self> {
        let mut builder = GitignoreBuilder::new(root);
        for line in DEFAULT_EXCLUDE_PATTERNS {
            builder
                .add_line(None, line)
                .with_context(|| format!("add default exclude pattern: {line}"))?;
        }
        for line in exclude_patterns {
            builder
                .add_line(None, line)
                .with_context(|| format!("add configured exclude pattern: {line}"))?;
        }
        let matcher = builder.build().context("build exclude matcher")?;
        Ok(Self {
            root: root.to_path_buf(),
            matcher,
        })
    }

    pub fn is_excluded(&self, rel_path: &str) -> bool {
        self.matcher
            .matched_path_or_any_parents(Path::new(rel_path), false)
            .is_ignore()
    }

    /// Default matcher rooted at `.`, for tests that don't care about exclude
    /// configuration. Not `cfg(test)`-gated so integration tests under
    /// `tests/` (compiled against this crate as an ordinary dependency) can
    /// use it too.
    pub fn default_for_tests() -> Self {
        Self::load(Path::new("."), &[]).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, time::SystemTime};

    fn make_temp_dir(prefix: &str) -> PathBuf {
        let mut root = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        root.push(format!("{prefix}-{nanos}"));
        fs::create_dir_all(&root).unwrap();
        root
    }

    #[test]
    fn default_patterns_exclude_git_and_control_dir() {
        let root = make_temp_dir("pushwork-filters-defaults");
        let filters = SyncFilters::load(&root, &[]).unwrap();
        assert!(filters.is_excluded(".git"));
        assert!(filters.is_excluded(".pushwork"));
        assert!(filters.is_excluded("build/output.tmp"));
    }

    #[test]
    fn configured_patterns_are_additive() {
        let root = make_temp_dir("pushwork-filters-configured");
        let filters = SyncFilters::load(&root, &["*.secret".to_string()]).unwrap();
        assert!(filters.is_excluded("keys.secret"));
        assert!(!filters.is_excluded("notes.txt"));
    }

    #[test]
    fn regular_files_are_not_excluded() {
        let root = make_temp_dir("pushwork-filters-regular");
        let filters = SyncFilters::load(&root, &[]).unwrap();
        assert!(!filters.is_excluded("src/main.rs"));
    }
}
