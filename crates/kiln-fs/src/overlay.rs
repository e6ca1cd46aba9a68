//! Overlay filesystem mounting.
//!
//! An overlay merges one or more read-only lower layers with an optional
//! writable upper layer (plus its work directory) at a merged mountpoint.
//! The option string is assembled here; the mount itself goes through the
//! generic [`Mountpoint`] primitive.

use std::path::{Path, PathBuf};

use kiln_common::error::{KilnError, KilnResult};
use kiln_common::exec::CommandRunner;
use kiln_common::version::kernel_version;

use crate::mount::Mountpoint;

/// An overlay mount, validated and fully described at construction.
#[derive(Debug)]
pub struct OverlayfsMount {
    merged: PathBuf,
    lower: Vec<PathBuf>,
    upper: Option<PathBuf>,
    work: Option<PathBuf>,
    mount: Mountpoint,
    mounted: bool,
}

impl OverlayfsMount {
    /// Validate and describe an overlay of `lower` (bottom first) merged
    /// at `merged`, optionally writable through `upper`/`work`.
    ///
    /// # Errors
    ///
    /// [`KilnError::Validation`] when `upper` and `work` are not both
    /// present or both absent, when a lower path contains a colon (the
    /// layer separator), when an extra option redefines
    /// `lowerdir`/`upperdir`/`workdir`, or when the merged target fails
    /// the generic mount validation.
    pub fn new<S>(
        merged: impl Into<PathBuf>,
        lower: Vec<PathBuf>,
        upper: Option<PathBuf>,
        work: Option<PathBuf>,
        extra_options: impl IntoIterator<Item = S>,
    ) -> KilnResult<Self>
    where
        S: Into<String>,
    {
        let merged = merged.into();
        if lower.is_empty() {
            return Err(KilnError::validation(
                "an overlay needs at least one lower directory",
            ));
        }
        if lower
            .iter()
            .any(|path| path.display().to_string().contains(':'))
        {
            return Err(KilnError::validation(
                "a lower directory path contains a colon, which serves as \
                 the layer separator of the overlay mount options",
            ));
        }
        if upper.is_some() != work.is_some() {
            return Err(KilnError::validation(
                "upperdir and workdir are interdependent, provide both or none",
            ));
        }
        let extra_options: Vec<String> = extra_options.into_iter().map(Into::into).collect();
        if extra_options.iter().any(|option| {
            option.starts_with("lowerdir=")
                || option.starts_with("upperdir=")
                || option.starts_with("workdir=")
        }) {
            return Err(KilnError::validation(
                "extra overlay options cannot redefine lowerdir, upperdir or workdir",
            ));
        }

        let mut options = vec![format!(
            "lowerdir={}",
            lower
                .iter()
                .map(|path| path.display().to_string())
                .collect::<Vec<_>>()
                .join(":")
        )];
        if let Some(upper) = &upper {
            options.push(format!("upperdir={}", upper.display()));
        }
        if let Some(work) = &work {
            options.push(format!("workdir={}", work.display()));
        }
        options.extend(extra_options);

        let mount = Mountpoint::new("overlay", &merged, Some("overlay"), options)?;
        Ok(Self {
            merged,
            lower,
            upper,
            work,
            mount,
            mounted: false,
        })
    }

    /// The merged mountpoint.
    #[must_use]
    pub fn merged(&self) -> &Path {
        &self.merged
    }

    /// The lower layers, bottom first.
    #[must_use]
    pub fn lower(&self) -> &[PathBuf] {
        &self.lower
    }

    /// The writable upper layer, when present.
    #[must_use]
    pub fn upper(&self) -> Option<&Path> {
        self.upper.as_deref()
    }

    /// The overlay work directory, when present.
    #[must_use]
    pub fn work(&self) -> Option<&Path> {
        self.work.as_deref()
    }

    /// The assembled mount options.
    #[must_use]
    pub fn options(&self) -> &[String] {
        self.mount.options()
    }

    /// Perform the overlay mount.
    ///
    /// # Errors
    ///
    /// Propagates the underlying mount failure.
    pub fn mount(&mut self, runner: &dyn CommandRunner) -> KilnResult<()> {
        if self.mounted {
            return Err(KilnError::validation(format!(
                "overlay at {} is already mounted",
                self.merged.display()
            )));
        }
        self.mount.mount(runner)?;
        self.mounted = true;
        Ok(())
    }

    /// Unmount the overlay.
    ///
    /// # Errors
    ///
    /// [`KilnError::Validation`] when not mounted; otherwise the
    /// underlying unmount failure.
    pub fn unmount(&mut self, runner: &dyn CommandRunner) -> KilnResult<()> {
        if !self.mounted {
            return Err(KilnError::validation(format!(
                "overlay at {} is not mounted",
                self.merged.display()
            )));
        }
        self.mount.unmount(runner)?;
        self.mounted = false;
        Ok(())
    }
}

/// Optional overlay tuning flags gated on the running kernel.
///
/// A squashfs-backed lower layer cannot support file handles, so file
/// indexing and NFS exporting are switched off where the kernel knows the
/// options; older kernels reject them, and an unreadable kernel version
/// simply omits them rather than failing the mount.
#[must_use]
pub fn kernel_tuning_options() -> Vec<String> {
    match kernel_version() {
        Ok(version) => {
            let mut options = Vec::new();
            if version >= (4, 13, 0) {
                options.push("index=off".to_owned());
            }
            if version >= (4, 16, 0) {
                options.push("nfs_export=off".to_owned());
            }
            options
        }
        Err(err) => {
            tracing::warn!(error = %err, "kernel version unknown, omitting overlay tuning options");
            Vec::new()
        }
    }
}
