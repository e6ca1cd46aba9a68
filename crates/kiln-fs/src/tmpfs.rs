//! In-memory filesystem mounting.
//!
//! Used both for dedicated `/tmp`-like mountpoints and as the backing
//! store for overlay upper and work directories.

use std::path::Path;

use kiln_common::error::{KilnError, KilnResult};
use kiln_common::exec::CommandRunner;

use crate::mount::Mountpoint;

/// A tmpfs mount with caller-supplied options (`size=10g`, `mode=1777`, ...).
#[derive(Debug)]
pub struct TmpfsMount {
    mount: Mountpoint,
    mounted: bool,
}

impl TmpfsMount {
    /// Validate and describe a tmpfs mount at `mountpoint`.
    ///
    /// # Errors
    ///
    /// [`KilnError::Validation`] under the generic mount validation rules
    /// (absolute normalized target, no comma in options).
    pub fn new<S>(
        mountpoint: impl AsRef<Path>,
        options: impl IntoIterator<Item = S>,
    ) -> KilnResult<Self>
    where
        S: Into<String>,
    {
        let mount = Mountpoint::new(
            "tmpfs",
            mountpoint.as_ref(),
            Some("tmpfs"),
            options,
        )?;
        Ok(Self {
            mount,
            mounted: false,
        })
    }

    /// The mount target.
    #[must_use]
    pub fn mountpoint(&self) -> &Path {
        self.mount.target()
    }

    /// Perform the mount.
    ///
    /// # Errors
    ///
    /// Propagates the underlying mount failure.
    pub fn mount(&mut self, runner: &dyn CommandRunner) -> KilnResult<()> {
        if self.mounted {
            return Err(KilnError::validation(format!(
                "tmpfs at {} is already mounted",
                self.mountpoint().display()
            )));
        }
        self.mount.mount(runner)?;
        self.mounted = true;
        Ok(())
    }

    /// Unmount.
    ///
    /// # Errors
    ///
    /// [`KilnError::Validation`] when not mounted; otherwise the
    /// underlying unmount failure.
    pub fn unmount(&mut self, runner: &dyn CommandRunner) -> KilnResult<()> {
        if !self.mounted {
            return Err(KilnError::validation(format!(
                "tmpfs at {} is not mounted",
                self.mountpoint().display()
            )));
        }
        self.mount.unmount(runner)?;
        self.mounted = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_common::exec::testing::ScriptedRunner;

    #[test]
    fn mount_command_line_shape() {
        let runner = ScriptedRunner::new();
        let mut tmpfs = TmpfsMount::new("/bundles/x/overlay/tmpfs", ["size=10g"]).unwrap();
        tmpfs.mount(&runner).unwrap();
        tmpfs.unmount(&runner).unwrap();
        assert_eq!(
            runner.command_lines(),
            vec![
                "mount -t tmpfs -o size=10g tmpfs /bundles/x/overlay/tmpfs",
                "umount /bundles/x/overlay/tmpfs",
            ]
        );
    }

    #[test]
    fn option_validation_applies() {
        assert!(TmpfsMount::new("/scratch", ["size=1g,mode=1777"]).is_err());
        assert!(TmpfsMount::new("relative/scratch", ["size=1g"]).is_err());
    }

    #[test]
    fn double_mount_is_rejected() {
        let runner = ScriptedRunner::new();
        let mut tmpfs = TmpfsMount::new("/scratch", ["size=1g"]).unwrap();
        tmpfs.mount(&runner).unwrap();
        assert!(matches!(
            tmpfs.mount(&runner),
            Err(KilnError::Validation { .. })
        ));
    }
}
