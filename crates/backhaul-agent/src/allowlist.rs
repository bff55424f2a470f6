use std::path::{Path, PathBuf};

/// Directory allowlist for files the agent may send
#[derive(Debug, Clone, Default)]
pub struct PathAllowlist {
    roots: Vec<PathBuf>,
}

impl PathAllowlist {
    /// Create a new allowlist from root directories
    ///
    /// Roots are canonicalized up front, so each one must exist.
    pub fn new(roots: Vec<PathBuf>) -> Result<Self, String> {
        let mut canonical_roots = Vec::new();

        for root in roots {
            let canonical = std::fs::canonicalize(&root)
                .map_err(|e| format!("Invalid allowed root '{}': {}", root.display(), e))?;
            if !canonical.is_dir() {
                return Err(format!(
                    "Allowed root '{}' is not a directory",
                    root.display()
                ));
            }
            canonical_roots.push(canonical);
        }

        Ok(Self {
            roots: canonical_roots,
        })
    }

    /// Check whether a canonical path lies under one of the roots
    ///
    /// Callers must resolve symlinks and `..` first; the check is purely
    /// lexical on path components.
    pub fn is_allowed(&self, canonical_path: &Path) -> bool {
        // Empty allowlist means allow everything
        if self.roots.is_empty() {
            return true;
        }

        self.roots.iter().any(|root| canonical_path.starts_with(root))
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}
