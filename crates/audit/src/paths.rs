use std::path::Path;

use ignore::gitignore::{Gitignore, GitignoreBuilder};

use crate::AuditError;

/// Gitignore-style glob set, matched against paths relative to the root.
#[derive(Debug, Clone)]
pub struct PathMatcher {
    globs: Gitignore,
}

impl PathMatcher {
    pub fn new(root: &Path, patterns: &[String]) -> Result<Self, AuditError> {
        let mut builder = GitignoreBuilder::new(root);
        for pattern in patterns {
            builder
                .add_line(None, pattern)
                .map_err(|e| AuditError::Pattern(format!("{pattern}: {e}")))?;
        }
        let globs = builder
            .build()
            .map_err(|e| AuditError::Pattern(e.to_string()))?;
        Ok(Self { globs })
    }

    /// `relative` matches itself or through one of its parent directories.
    pub fn matches(&self, relative: &str) -> bool {
        self.globs
            .matched_path_or_any_parents(relative, false)
            .is_ignore()
    }
}

/// Forward-slash path of `path` relative to `root`.
pub fn relative_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
