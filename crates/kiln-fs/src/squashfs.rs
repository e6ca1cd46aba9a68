//! Squashfs image mounting and creation.
//!
//! Mounting a squashfs file composes two kernel resources: a read-only
//! loop device over the image, then a `squashfs` mount of that device.
//! They are released in reverse order on every path, including when the
//! mount step fails right after the attach succeeded.

use std::path::{Path, PathBuf};
use std::time::Duration;

use kiln_common::error::{KilnError, KilnResult, fold_failures};
use kiln_common::exec::CommandRunner;

use crate::loopdev::LoopDevice;
use crate::mount::Mountpoint;

/// Timeout for the image compressor. Generous: compressing a full SDK
/// rootfs takes minutes.
const MKSQUASHFS_TIMEOUT: Duration = Duration::from_secs(600);

/// A mounted (or mountable) squashfs image.
#[derive(Debug)]
pub struct SquashfsMount {
    image: PathBuf,
    mountpoint: PathBuf,
    mounted: Option<Mounted>,
}

#[derive(Debug)]
struct Mounted {
    loopdev: LoopDevice,
    mount: Mountpoint,
}

impl SquashfsMount {
    /// Describe a squashfs mount of `image` at `mountpoint`.
    #[must_use]
    pub fn new(image: impl Into<PathBuf>, mountpoint: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
            mountpoint: mountpoint.into(),
            mounted: None,
        }
    }

    /// The image file.
    #[must_use]
    pub fn image(&self) -> &Path {
        &self.image
    }

    /// The mount target.
    #[must_use]
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// The loop device node currently backing the mount.
    #[must_use]
    pub fn device(&self) -> Option<&Path> {
        self.mounted
            .as_ref()
            .and_then(|mounted| mounted.loopdev.device())
    }

    /// Attach a read-only loop device over the image and mount it.
    ///
    /// When the mount step fails, the loop device is detached (exactly
    /// once) before the error propagates; a failure of that detach is
    /// attached to the original error, never replacing it.
    ///
    /// # Errors
    ///
    /// Propagates loop attach and mount failures.
    pub fn mount(&mut self, runner: &dyn CommandRunner) -> KilnResult<()> {
        if self.mounted.is_some() {
            return Err(KilnError::validation(format!(
                "squashfs image {} is already mounted",
                self.image.display()
            )));
        }

        let mut loopdev = LoopDevice::new(&self.image, true);
        let device = loopdev.attach(runner)?;

        let result = Mountpoint::new(
            device.display().to_string(),
            &self.mountpoint,
            Some("squashfs"),
            ["ro"],
        )
        .and_then(|mount| mount.mount(runner).map(|()| mount));

        match result {
            Ok(mount) => {
                self.mounted = Some(Mounted { loopdev, mount });
                Ok(())
            }
            Err(err) => {
                let mut failures = Vec::new();
                if let Err(detach_err) = loopdev.detach(runner) {
                    tracing::error!(
                        image = %self.image.display(),
                        error = %detach_err,
                        "failed to detach loop device while recovering from a mount failure"
                    );
                    failures.push(detach_err);
                }
                Err(err.with_related(failures))
            }
        }
    }

    /// Unmount and detach, in reverse acquisition order. Both releases are
    /// attempted even when the first fails.
    ///
    /// # Errors
    ///
    /// [`KilnError::Validation`] when not mounted; otherwise the first
    /// release failure, with any further ones attached.
    pub fn unmount(&mut self, runner: &dyn CommandRunner) -> KilnResult<()> {
        let Some(Mounted { mut loopdev, mount }) = self.mounted.take() else {
            return Err(KilnError::validation(format!(
                "squashfs image {} is not mounted",
                self.image.display()
            )));
        };
        let mut failures = Vec::new();
        if let Err(err) = mount.unmount(runner) {
            failures.push(err);
        }
        if let Err(err) = loopdev.detach(runner) {
            failures.push(err);
        }
        fold_failures(failures).map_or(Ok(()), Err)
    }
}

/// Options for [`mksquashfs`]. The defaults match what the tool itself
/// would do for a scratch image; snapshots enable xattr storage, sparse
/// file detection and duplicate checking.
#[derive(Debug, Clone)]
pub struct MksquashfsOptions {
    /// Compression method.
    pub compressor: String,
    /// Store extended attributes.
    pub store_xattrs: bool,
    /// Detect sparse files (recommended).
    pub detect_sparse_files: bool,
    /// Compress the inode table.
    pub compress_inode_table: bool,
    /// Compress data blocks.
    pub compress_data_blocks: bool,
    /// Compress fragment blocks.
    pub compress_fragment_blocks: bool,
    /// Compress extended attributes.
    pub compress_extended_attributes: bool,
    /// Perform duplicate checking.
    pub find_duplicates: bool,
}

impl Default for MksquashfsOptions {
    fn default() -> Self {
        Self {
            compressor: "gzip".to_owned(),
            store_xattrs: true,
            detect_sparse_files: true,
            compress_inode_table: false,
            compress_data_blocks: false,
            compress_fragment_blocks: false,
            compress_extended_attributes: false,
            find_duplicates: false,
        }
    }
}

impl MksquashfsOptions {
    /// The option set used when snapshotting a container rootfs.
    #[must_use]
    pub fn snapshot() -> Self {
        Self {
            find_duplicates: true,
            ..Self::default()
        }
    }
}

/// Compress `source_dir` into the squashfs image `image`.
///
/// A pre-existing image file is removed first: `mksquashfs` appends to
/// existing files instead of replacing them.
///
/// # Errors
///
/// [`KilnError::Validation`] when `source_dir` is not a directory,
/// [`KilnError::SystemCommand`] when the compressor fails or times out.
pub fn mksquashfs(
    image: &Path,
    source_dir: &Path,
    options: &MksquashfsOptions,
    runner: &dyn CommandRunner,
) -> KilnResult<()> {
    if !source_dir.is_dir() {
        return Err(KilnError::validation(format!(
            "squashfs source {} must be a valid directory",
            source_dir.display()
        )));
    }
    if image.exists() {
        std::fs::remove_file(image)?;
    }

    let mut argv = vec![
        "mksquashfs".to_owned(),
        source_dir.display().to_string(),
        image.display().to_string(),
        "-comp".to_owned(),
        options.compressor.clone(),
    ];
    argv.push(if options.store_xattrs { "-xattrs" } else { "-no-xattrs" }.to_owned());
    if !options.compress_inode_table {
        argv.push("-noI".to_owned());
    }
    if !options.compress_data_blocks {
        argv.push("-noD".to_owned());
    }
    if !options.compress_fragment_blocks {
        argv.push("-noF".to_owned());
    }
    if !options.compress_extended_attributes {
        argv.push("-noX".to_owned());
    }
    if !options.detect_sparse_files {
        argv.push("-no-sparse".to_owned());
    }
    if !options.find_duplicates {
        argv.push("-noappend".to_owned());
    }

    runner.run_captured(&argv, Some(MKSQUASHFS_TIMEOUT))?;
    tracing::info!(
        image = %image.display(),
        source = %source_dir.display(),
        "squashfs image created"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_common::exec::testing::ScriptedRunner;

    fn scripted_attach(runner: &ScriptedRunner, device: &str, image: &str) {
        runner.enqueue_output("losetup", "");
        runner.enqueue_output("losetup", &format!("{device} {image} 1\n"));
    }

    #[test]
    fn mount_runs_attach_then_mount() {
        let runner = ScriptedRunner::new();
        scripted_attach(&runner, "/dev/loop2", "/images/sdk.squashfs");
        let mut squash = SquashfsMount::new("/images/sdk.squashfs", "/bundles/x/rootfs");
        squash.mount(&runner).unwrap();
        assert_eq!(squash.device(), Some(Path::new("/dev/loop2")));
        assert_eq!(
            runner.command_lines(),
            vec![
                "losetup -r -f /images/sdk.squashfs",
                "losetup -O NAME,BACK-FILE,RO -n -l --raw",
                "mount -t squashfs -o ro /dev/loop2 /bundles/x/rootfs",
            ]
        );
    }

    #[test]
    fn failed_mount_detaches_the_loop_device_once() {
        let runner = ScriptedRunner::new();
        scripted_attach(&runner, "/dev/loop2", "/images/sdk.squashfs");
        runner.enqueue_failure("mount", "returned exit status 32");
        let mut squash = SquashfsMount::new("/images/sdk.squashfs", "/bundles/x/rootfs");
        let err = squash.mount(&runner).unwrap_err();
        assert!(matches!(err, KilnError::SystemCommand(_)));
        let detaches = runner
            .command_lines()
            .iter()
            .filter(|line| line.starts_with("losetup -d"))
            .count();
        assert_eq!(detaches, 1);
    }

    #[test]
    fn unmount_releases_in_reverse_order() {
        let runner = ScriptedRunner::new();
        scripted_attach(&runner, "/dev/loop2", "/images/sdk.squashfs");
        let mut squash = SquashfsMount::new("/images/sdk.squashfs", "/bundles/x/rootfs");
        squash.mount(&runner).unwrap();
        squash.unmount(&runner).unwrap();
        let lines = runner.command_lines();
        assert_eq!(lines[3], "umount /bundles/x/rootfs");
        assert_eq!(lines[4], "losetup -d /dev/loop2");
        // The loop device table is as it was before entry: one attach, one
        // detach.
        assert!(squash.device().is_none());
    }

    #[test]
    fn unmount_attempts_detach_even_when_umount_fails() {
        let runner = ScriptedRunner::new();
        scripted_attach(&runner, "/dev/loop2", "/images/sdk.squashfs");
        let mut squash = SquashfsMount::new("/images/sdk.squashfs", "/bundles/x/rootfs");
        squash.mount(&runner).unwrap();
        runner.enqueue_failure("umount", "returned exit status 32");
        let err = squash.unmount(&runner).unwrap_err();
        assert!(matches!(err, KilnError::SystemCommand(_)));
        assert!(
            runner
                .command_lines()
                .iter()
                .any(|line| line == "losetup -d /dev/loop2")
        );
    }

    #[test]
    fn mksquashfs_snapshot_flags() {
        let runner = ScriptedRunner::new();
        let source = tempfile::tempdir().unwrap();
        let image = source.path().join("out.squashfs");
        mksquashfs(
            &image,
            source.path(),
            &MksquashfsOptions::snapshot(),
            &runner,
        )
        .unwrap();
        let line = runner.command_lines().remove(0);
        assert!(line.starts_with("mksquashfs"));
        assert!(line.contains("-comp gzip"));
        assert!(line.contains("-xattrs"));
        assert!(line.contains("-noI"));
        assert!(line.contains("-noX"));
        assert!(!line.contains("-no-sparse"));
        assert!(!line.contains("-noappend"));
    }

    #[test]
    fn mksquashfs_rejects_missing_source() {
        let runner = ScriptedRunner::new();
        let err = mksquashfs(
            Path::new("/tmp/out.squashfs"),
            Path::new("/no/such/dir"),
            &MksquashfsOptions::default(),
            &runner,
        )
        .unwrap_err();
        assert!(matches!(err, KilnError::Validation { .. }));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn mksquashfs_removes_preexisting_image() {
        let runner = ScriptedRunner::new();
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("out.squashfs");
        std::fs::write(&image, b"stale").unwrap();
        mksquashfs(&image, dir.path(), &MksquashfsOptions::default(), &runner).unwrap();
        assert!(!image.exists());
    }
}
