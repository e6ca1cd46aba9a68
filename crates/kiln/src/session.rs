//! Container session lifecycle.
//!
//! A session owns one uniquely-named bundle directory and the rootfs
//! assembled inside it from the container's squashfs image. The mount
//! stack is acquired in strict nested order on open and released in exact
//! reverse order on close, always, even when a command run through the
//! session failed in between.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_common::error::{KilnError, KilnResult, fold_failures};
use kiln_common::exec::CommandRunner;
use kiln_common::release::ReleaseStack;
use kiln_fs::overlay::{OverlayfsMount, kernel_tuning_options};
use kiln_fs::squashfs::{MksquashfsOptions, SquashfsMount, mksquashfs};
use kiln_fs::tmpfs::TmpfsMount;
use kiln_fs::mount;
use tempfile::TempDir;

use crate::container::{Container, RunOptions};
use crate::launcher::find_launcher;

/// Size cap for the tmpfs backing the overlay upper and work directories.
const OVERLAY_TMPFS_SIZE: &str = "size=10g";

/// Host resolver configuration, copied into rootfs assemblies that share
/// the host network namespace.
const HOST_RESOLV_CONF: &str = "/etc/resolv.conf";

/// A running container session.
///
/// Dropping an open session performs a best-effort teardown; call
/// [`ContainerSession::close`] to observe teardown failures.
pub struct ContainerSession {
    container: Container,
    runner: Arc<dyn CommandRunner>,
    // The stack must unwind (unmount) before the bundle directory is
    // removed; field order matters for Drop.
    stack: ReleaseStack,
    bundle: Option<TempDir>,
    bundle_dir: PathBuf,
    rootfs_dir: PathBuf,
    instance: String,
    launcher: Option<PathBuf>,
    closed: bool,
}

impl std::fmt::Debug for ContainerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerSession")
            .field("container", &self.container.name())
            .field("bundle_dir", &self.bundle_dir)
            .field("instance", &self.instance)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl ContainerSession {
    /// Open a session: create a fresh bundle directory under
    /// `runtime_dir` and assemble the container rootfs inside it.
    ///
    /// Read-only containers mount the squashfs image directly at the
    /// rootfs directory. Writable containers mount it as the overlay
    /// lower layer, back upper and work directories with a tmpfs, and
    /// merge the overlay at the rootfs directory.
    ///
    /// On any assembly failure, everything already acquired is released
    /// in reverse order before the error is returned; release failures
    /// are attached to the original error.
    ///
    /// # Errors
    ///
    /// Propagates validation, environment and command failures from the
    /// mount stack.
    pub fn open(
        container: Container,
        runtime_dir: &Path,
        runner: Arc<dyn CommandRunner>,
    ) -> KilnResult<Self> {
        std::fs::create_dir_all(runtime_dir)?;

        // The random tempdir suffix doubles as the unique container
        // instance name handed to the launcher.
        let bundle = tempfile::Builder::new()
            .prefix(&format!("{}.", container.name()))
            .tempdir_in(runtime_dir)?;
        let bundle_dir = bundle.path().to_path_buf();
        let instance = bundle_dir
            .file_name()
            .map_or_else(|| container.name().to_owned(), |name| {
                name.to_string_lossy().into_owned()
            });

        let rootfs_dir = bundle_dir.join("rootfs");
        std::fs::create_dir(&rootfs_dir)?;

        let mut stack = ReleaseStack::new();
        if let Err(err) = Self::assemble(&container, &bundle_dir, &rootfs_dir, &mut stack, &runner)
        {
            let failures = stack.release_all();
            return Err(err.with_related(failures));
        }

        tracing::info!(
            container = container.name(),
            bundle = %bundle_dir.display(),
            instance = %instance,
            readonly = container.is_readonly_root(),
            "container session open"
        );
        Ok(Self {
            container,
            runner,
            stack,
            bundle: Some(bundle),
            bundle_dir,
            rootfs_dir,
            instance,
            launcher: None,
            closed: false,
        })
    }

    fn assemble(
        container: &Container,
        bundle_dir: &Path,
        rootfs_dir: &Path,
        stack: &mut ReleaseStack,
        runner: &Arc<dyn CommandRunner>,
    ) -> KilnResult<()> {
        if container.is_readonly_root() {
            Self::push_squashfs(container.rootfs_image(), rootfs_dir, stack, runner)?;
            return Ok(());
        }

        let overlay_dir = bundle_dir.join("overlay");
        let lower_dir = overlay_dir.join("lower");
        let tmpfs_dir = overlay_dir.join("tmpfs");
        std::fs::create_dir(&overlay_dir)?;
        std::fs::create_dir(&lower_dir)?;
        std::fs::create_dir(&tmpfs_dir)?;

        Self::push_squashfs(container.rootfs_image(), &lower_dir, stack, runner)?;

        let mut tmpfs = TmpfsMount::new(&tmpfs_dir, [OVERLAY_TMPFS_SIZE])?;
        tmpfs.mount(&**runner)?;
        {
            let runner = Arc::clone(runner);
            let target = tmpfs_dir.clone();
            stack.push(format!("tmpfs at {}", target.display()), move || {
                mount::unmount(&target, &*runner)
            });
        }

        let upper_dir = tmpfs_dir.join("upper");
        let work_dir = tmpfs_dir.join("work");
        std::fs::create_dir(&upper_dir)?;
        std::fs::create_dir(&work_dir)?;

        let mut overlay = OverlayfsMount::new(
            rootfs_dir,
            vec![lower_dir],
            Some(upper_dir),
            Some(work_dir),
            kernel_tuning_options(),
        )?;
        overlay.mount(&**runner)?;
        {
            let runner = Arc::clone(runner);
            let target = rootfs_dir.to_path_buf();
            stack.push(format!("overlay at {}", target.display()), move || {
                mount::unmount(&target, &*runner)
            });
        }

        if container.shares_host_netns() && Path::new(HOST_RESOLV_CONF).exists() {
            let etc_dir = rootfs_dir.join("etc");
            std::fs::create_dir_all(&etc_dir)?;
            let _ = std::fs::copy(HOST_RESOLV_CONF, etc_dir.join("resolv.conf"))?;
        }
        Ok(())
    }

    fn push_squashfs(
        image: &Path,
        target: &Path,
        stack: &mut ReleaseStack,
        runner: &Arc<dyn CommandRunner>,
    ) -> KilnResult<()> {
        let mut squash = SquashfsMount::new(image, target);
        squash.mount(&**runner)?;
        let runner = Arc::clone(runner);
        let label = format!("squashfs at {}", target.display());
        // SquashfsMount releases its own two resources (mount, then loop
        // device) in reverse order.
        stack.push(label, move || squash.unmount(&*runner));
        Ok(())
    }

    /// The container this session was opened from.
    #[must_use]
    pub const fn container(&self) -> &Container {
        &self.container
    }

    /// The bundle directory holding `config.json` and the rootfs.
    #[must_use]
    pub fn bundle_dir(&self) -> &Path {
        &self.bundle_dir
    }

    /// The assembled rootfs directory.
    #[must_use]
    pub fn rootfs_dir(&self) -> &Path {
        &self.rootfs_dir
    }

    /// The unique instance name handed to the launcher.
    #[must_use]
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Override the launcher binary instead of discovering `runc` /
    /// `docker-runc` in `PATH` on each run.
    pub fn set_launcher(&mut self, launcher: impl Into<PathBuf>) {
        self.launcher = Some(launcher.into());
    }

    /// Run a command in the session.
    ///
    /// Serializes a fresh runtime specification into the bundle and
    /// invokes the launcher. A failure (non-zero exit, launcher missing)
    /// surfaces as an error but does not tear the session down; further
    /// commands may run afterwards.
    ///
    /// Long-running build commands are deliberately not timed.
    ///
    /// # Errors
    ///
    /// [`KilnError::SessionState`] after [`ContainerSession::close`],
    /// [`KilnError::Validation`] for an empty command,
    /// [`KilnError::Environment`] when no launcher is installed,
    /// [`KilnError::SystemCommand`] when the launcher exits non-zero.
    pub fn run(&mut self, command: &[String], options: &RunOptions) -> KilnResult<()> {
        if self.closed {
            return Err(KilnError::session_state("run a command", "closed"));
        }
        if command.is_empty() {
            return Err(KilnError::validation("cannot run an empty command line"));
        }

        let spec = self.container.runtime_spec(command, options);
        let config_path = self.bundle_dir.join("config.json");
        let config = std::fs::File::create(&config_path)?;
        serde_json::to_writer_pretty(config, &spec)
            .map_err(|err| KilnError::Io(std::io::Error::other(err)))?;

        let launcher = match &self.launcher {
            Some(launcher) => launcher.clone(),
            None => find_launcher()?,
        };
        let argv = vec![
            launcher.display().to_string(),
            "run".to_owned(),
            "--bundle".to_owned(),
            self.bundle_dir.display().to_string(),
            self.instance.clone(),
        ];
        tracing::info!(
            instance = %self.instance,
            command = ?command,
            "running command in container"
        );
        self.runner.run_attached(&argv, None, options.terminal)
    }

    /// Snapshot the current rootfs contents into a new squashfs image.
    ///
    /// # Errors
    ///
    /// [`KilnError::Snapshot`] on a read-only session (before any
    /// filesystem side effect) or when the compression step fails;
    /// [`KilnError::SessionState`] after close.
    pub fn snapshot(&self, output_image: &Path) -> KilnResult<()> {
        if self.closed {
            return Err(KilnError::session_state("snapshot the rootfs", "closed"));
        }
        if self.container.is_readonly_root() {
            return Err(KilnError::snapshot(
                "the container rootfs is read-only; a snapshot would be \
                 identical to the image that created it",
            ));
        }
        mksquashfs(
            output_image,
            &self.rootfs_dir,
            &MksquashfsOptions::snapshot(),
            &*self.runner,
        )
        .map_err(|err| KilnError::Snapshot {
            message: format!(
                "could not produce a squashfs image at {}",
                output_image.display()
            ),
            source: Some(Box::new(err)),
        })
    }

    /// Tear the mount stack down in exact reverse order of assembly and
    /// remove the bundle directory.
    ///
    /// Idempotent: a second close is a no-op. Teardown is always
    /// best-effort across every held resource; failures are folded into
    /// the returned error.
    ///
    /// # Errors
    ///
    /// The first teardown failure, with any further ones attached.
    pub fn close(&mut self) -> KilnResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut failures = self.stack.release_all();
        if let Some(bundle) = self.bundle.take() {
            if let Err(err) = bundle.close() {
                failures.push(KilnError::Io(err));
            }
        }
        tracing::info!(instance = %self.instance, "container session closed");
        fold_failures(failures).map_or(Ok(()), Err)
    }
}

impl Drop for ContainerSession {
    fn drop(&mut self) {
        if !self.closed {
            tracing::warn!(
                instance = %self.instance,
                "container session dropped while open; releasing"
            );
            let _ = self.close();
        }
    }
}
