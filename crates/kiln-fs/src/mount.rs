//! Generic mount/unmount primitive.
//!
//! Wraps the traditional `mount(8)` / `umount(8)` command line utilities.
//! A [`Mountpoint`] validates its `(source, target, type, options)` tuple
//! at construction, before any system call is issued.

use std::path::{Component, Path, PathBuf};

use kiln_common::error::{KilnError, KilnResult};
use kiln_common::exec::CommandRunner;

use crate::ADMIN_CMD_TIMEOUT;

/// A single mount, validated at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mountpoint {
    source: String,
    target: PathBuf,
    fs_type: Option<String>,
    options: Vec<String>,
}

impl Mountpoint {
    /// Validate and build a mountpoint.
    ///
    /// `source` is not required to be a path: pseudo-filesystems use dummy
    /// names (`tmpfs`, `overlay`). `target` must already be an absolute,
    /// normalized path.
    ///
    /// # Errors
    ///
    /// [`KilnError::Validation`] when the target is relative or not
    /// normalized, or when an option contains a comma (the separator of
    /// the underlying mount command's option list).
    pub fn new<S>(
        source: impl Into<String>,
        target: impl Into<PathBuf>,
        fs_type: Option<&str>,
        options: impl IntoIterator<Item = S>,
    ) -> KilnResult<Self>
    where
        S: Into<String>,
    {
        let target = target.into();
        if !is_normalized(&target) {
            return Err(KilnError::validation(format!(
                "mount target {} must be an absolute and normalized path",
                target.display()
            )));
        }
        let options: Vec<String> = options.into_iter().map(Into::into).collect();
        validate_options(&options)?;
        Ok(Self {
            source: source.into(),
            target,
            fs_type: fs_type.map(ToOwned::to_owned),
            options,
        })
    }

    /// The mount source.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The mount target.
    #[must_use]
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// The filesystem type, when one is forced.
    #[must_use]
    pub fn fs_type(&self) -> Option<&str> {
        self.fs_type.as_deref()
    }

    /// The mount options.
    #[must_use]
    pub fn options(&self) -> &[String] {
        &self.options
    }

    /// Perform the mount.
    ///
    /// # Errors
    ///
    /// [`KilnError::SystemCommand`] when `mount(8)` fails or times out,
    /// [`KilnError::Environment`] when it is not installed.
    pub fn mount(&self, runner: &dyn CommandRunner) -> KilnResult<()> {
        let mut argv = vec!["mount".to_owned()];
        if let Some(fs_type) = &self.fs_type {
            argv.push("-t".to_owned());
            argv.push(fs_type.clone());
        }
        if !self.options.is_empty() {
            argv.push("-o".to_owned());
            argv.push(self.options.join(","));
        }
        argv.push(self.source.clone());
        argv.push(self.target.display().to_string());

        runner.run_captured(&argv, Some(ADMIN_CMD_TIMEOUT))?;
        tracing::debug!(
            source = %self.source,
            target = %self.target.display(),
            fs_type = ?self.fs_type,
            "mounted"
        );
        Ok(())
    }

    /// Undo the mount. Must be attempted during cleanup regardless of why
    /// cleanup was triggered.
    ///
    /// # Errors
    ///
    /// Same taxonomy as [`Mountpoint::mount`].
    pub fn unmount(&self, runner: &dyn CommandRunner) -> KilnResult<()> {
        unmount(&self.target, runner)
    }
}

/// Unmount a target path. Free function so deferred-release closures can
/// unmount without holding the original [`Mountpoint`].
///
/// # Errors
///
/// [`KilnError::SystemCommand`] when `umount(8)` fails or times out.
pub fn unmount(target: &Path, runner: &dyn CommandRunner) -> KilnResult<()> {
    let argv = vec!["umount".to_owned(), target.display().to_string()];
    runner.run_captured(&argv, Some(ADMIN_CMD_TIMEOUT))?;
    tracing::debug!(target = %target.display(), "unmounted");
    Ok(())
}

fn validate_options(options: &[String]) -> KilnResult<()> {
    if options.iter().any(|option| option.contains(',')) {
        return Err(KilnError::validation(
            "a mount option contains a comma, which serves as the option \
             separator of the underlying mount command",
        ));
    }
    Ok(())
}

/// Whether `path` is absolute and lexically normalized (no `.`, `..`,
/// duplicate or trailing separators).
#[must_use]
pub fn is_normalized(path: &Path) -> bool {
    if !path.is_absolute() {
        return false;
    }
    if path
        .components()
        .any(|c| matches!(c, Component::CurDir | Component::ParentDir))
    {
        return false;
    }
    let rebuilt: PathBuf = path.components().collect();
    rebuilt.as_os_str() == path.as_os_str()
}
