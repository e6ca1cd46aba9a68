//! Standard filesystem paths for kiln.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default root directory for kiln runtime state.
pub static KILN_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("KILN_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/kiln"))
});

/// Standard paths used by the kiln runtime.
#[derive(Debug, Clone)]
pub struct KilnPaths {
    /// Root state directory (default: `/var/lib/kiln`, overridable through
    /// `KILN_ROOT`).
    pub root: PathBuf,
}

impl KilnPaths {
    /// Create paths with the default root.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths under a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory receiving the per-session container bundles.
    #[must_use]
    pub fn containers(&self) -> PathBuf {
        self.root.join("containers")
    }

    /// Scratch directory for bootstrap staging trees.
    #[must_use]
    pub fn tmp(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Create all runtime directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.containers())?;
        std::fs::create_dir_all(self.tmp())?;
        Ok(())
    }
}

impl Default for KilnPaths {
    fn default() -> Self {
        Self {
            root: KILN_ROOT.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_root() {
        let paths = KilnPaths::with_root("/tmp/kiln-test");
        assert_eq!(paths.containers(), PathBuf::from("/tmp/kiln-test/containers"));
        assert_eq!(paths.tmp(), PathBuf::from("/tmp/kiln-test/tmp"));
    }

    #[test]
    fn create_dirs_is_idempotent() {
        let temp = tempfile::tempdir().unwrap();
        let paths = KilnPaths::with_root(temp.path().join("state"));
        paths.create_dirs().unwrap();
        paths.create_dirs().unwrap();
        assert!(paths.containers().is_dir());
        assert!(paths.tmp().is_dir());
    }
}
