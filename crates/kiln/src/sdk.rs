//! SDK session orchestration.
//!
//! An [`Sdk`] carries the fixed execution policy of a build environment:
//! working directory, base environment, terminal attachment, prelude and
//! postlude command pipelines, plus extra capabilities and device
//! bindings. Opening it against a [`Container`] yields an [`SdkSession`]
//! that runs ad-hoc commands with that policy; closing it runs the
//! postludes and tears the container session down, reporting wind-down
//! failures without ever erasing a body failure already in flight.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::read::GzDecoder;
use kiln_common::cmdline;
use kiln_common::error::{KilnError, KilnResult};
use kiln_common::exec::CommandRunner;
use kiln_common::paths::KilnPaths;
use kiln_common::privileges::{self, PrivilegeContext};
use kiln_fs::squashfs::{MksquashfsOptions, mksquashfs};

use crate::container::{Container, ContainerMount, DeviceBinding, RunOptions};
use crate::env::{self, BuildContext};
use crate::session::ContainerSession;

/// Fixed execution policy for SDK container sessions.
#[derive(Debug, Clone, Default)]
pub struct Sdk {
    cwd: String,
    env: BTreeMap<String, String>,
    terminal: bool,
    prelude_commands: Vec<String>,
    postlude_commands: Vec<String>,
    additional_capabilities: Vec<String>,
    additional_device_bindings: Vec<PathBuf>,
    launcher: Option<PathBuf>,
}

impl Sdk {
    /// A policy with `/` as working directory, no extra environment and
    /// no prelude/postlude commands.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cwd: "/".to_owned(),
            ..Self::default()
        }
    }

    /// Working directory for every command of the session.
    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = cwd.into();
        self
    }

    /// Base environment, merged beneath per-call overrides and the build
    /// context variables.
    #[must_use]
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Attach the caller's terminal to every command of the session.
    #[must_use]
    pub const fn with_terminal(mut self, terminal: bool) -> Self {
        self.terminal = terminal;
        self
    }

    /// Commands run once, in order, when a session opens. Any failure
    /// aborts the session entry.
    #[must_use]
    pub fn with_prelude_commands(mut self, commands: Vec<String>) -> Self {
        self.prelude_commands = commands;
        self
    }

    /// Commands run once, in order, when a session closes.
    #[must_use]
    pub fn with_postlude_commands(mut self, commands: Vec<String>) -> Self {
        self.postlude_commands = commands;
        self
    }

    /// Capabilities granted on top of the container defaults.
    #[must_use]
    pub fn with_additional_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.additional_capabilities = capabilities;
        self
    }

    /// Host device nodes bound into the containers.
    #[must_use]
    pub fn with_additional_device_bindings(mut self, devices: Vec<PathBuf>) -> Self {
        self.additional_device_bindings = devices;
        self
    }

    /// Override the launcher binary for sessions opened by this policy
    /// (nonstandard installs; discovery through `PATH` otherwise).
    #[must_use]
    pub fn with_launcher(mut self, launcher: impl Into<PathBuf>) -> Self {
        self.launcher = Some(launcher.into());
        self
    }

    /// Apply the SDK policy (extra capabilities, device bindings, tmp
    /// mounts) to a container.
    fn apply(&self, mut container: Container) -> KilnResult<Container> {
        for capability in &self.additional_capabilities {
            container = container.with_capability(capability.clone());
        }
        for device in &self.additional_device_bindings {
            container = container.with_device_binding(DeviceBinding::from_host(
                device.clone(),
                None,
            )?);
        }
        // GNU tar trips over directory renames on an overlayfs (Portage
        // exercises this constantly under /var/tmp), so both tmp trees
        // are dedicated tmpfs mounts rather than rootfs upperdir paths.
        container = container
            .with_mount(ContainerMount::new(
                "tmpfs",
                "/tmp",
                Some("tmpfs"),
                ["nodev", "nosuid"],
            )?)
            .with_mount(ContainerMount::new(
                "tmpfs",
                "/var/tmp",
                Some("tmpfs"),
                // No mount options: Portage manages permissions itself.
                Vec::<String>::new(),
            )?);
        Ok(container)
    }

    /// Open an SDK session on `container`: assemble the rootfs and run
    /// the prelude commands in order.
    ///
    /// A prelude failure closes the container session again (teardown
    /// failures attached to the prelude error) and aborts the entry.
    ///
    /// # Errors
    ///
    /// Propagates assembly and prelude failures.
    pub fn open(
        &self,
        container: Container,
        context: &BuildContext,
        extra_env: &BTreeMap<String, String>,
        runtime_dir: &Path,
        runner: Arc<dyn CommandRunner>,
    ) -> KilnResult<SdkSession> {
        let container = self.apply(container)?;
        let options = RunOptions {
            cwd: self.cwd.clone(),
            env: env::session_env(&self.env, extra_env, context),
            terminal: self.terminal,
            user: (0, 0),
        };

        let mut session = ContainerSession::open(container, runtime_dir, runner)?;
        if let Some(launcher) = &self.launcher {
            session.set_launcher(launcher.clone());
        }

        let prelude_result = Self::run_pipeline(
            &mut session,
            &self.prelude_commands,
            &options,
            "prelude",
        );
        if let Err(err) = prelude_result {
            let mut failures = Vec::new();
            if let Err(close_err) = session.close() {
                failures.push(close_err);
            }
            return Err(err.with_related(failures));
        }

        Ok(SdkSession {
            session,
            options,
            postlude_commands: self.postlude_commands.clone(),
            closed: false,
        })
    }

    /// Open a session, hand it to `body`, then close it, running the
    /// postlude commands and tearing down the mount stack even when the
    /// body failed. The body error stays primary; wind-down failures are
    /// attached to it.
    ///
    /// # Errors
    ///
    /// Propagates open, body and wind-down failures, combined as above.
    pub fn with_session<T>(
        &self,
        container: Container,
        context: &BuildContext,
        extra_env: &BTreeMap<String, String>,
        runtime_dir: &Path,
        runner: Arc<dyn CommandRunner>,
        body: impl FnOnce(&mut SdkSession) -> KilnResult<T>,
    ) -> KilnResult<T> {
        let mut session = self.open(container, context, extra_env, runtime_dir, runner)?;
        let body_result = body(&mut session);
        let close_result = session.close();
        match (body_result, close_result) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) | (Err(err), Ok(())) => Err(err),
            (Err(body_err), Err(close_err)) => Err(body_err.with_related(vec![close_err])),
        }
    }

    /// Bootstrap an SDK image from a rootfs tar archive.
    ///
    /// The archive is extracted (ownership and xattrs preserved) and
    /// compressed into a temporary squashfs image; a host-network session
    /// on that image runs the prelude commands, the bootstrap steps and
    /// the postlude commands, then its rootfs is snapshotted into the
    /// final SDK image. Both produced images are handed back to the
    /// unprivileged user. Having no bootstrap step is legitimate: the
    /// archive may already contain a fully prepared SDK rootfs.
    ///
    /// # Errors
    ///
    /// Propagates extraction, compression, session and privilege
    /// failures; wind-down failures are attached, never primary.
    pub fn bootstrap(
        &self,
        privileges: &PrivilegeContext,
        request: &BootstrapRequest,
        context: &BuildContext,
        extra_env: &BTreeMap<String, String>,
        paths: &KilnPaths,
        runner: &Arc<dyn CommandRunner>,
    ) -> KilnResult<()> {
        paths.create_dirs()?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!("bootstrap-{}.", request.container_name))
            .tempdir_in(paths.tmp())?;
        let bootstrap_image = scratch.path().join("to-bootstrap.squashfs");
        let contents_dir = scratch.path().join("tar-contents");
        std::fs::create_dir(&contents_dir)?;

        let staging = Self::stage_bootstrap_image(
            privileges,
            &request.rootfs_archive,
            &contents_dir,
            &bootstrap_image,
            runner,
        );
        // The extracted tree holds root-owned files; it must be wiped
        // with elevated privileges before the scratch directory can go.
        let cleanup = Self::wipe_elevated(privileges, &contents_dir);
        match (staging, cleanup) {
            (Err(err), cleanup) => {
                return Err(err.with_related(cleanup.err().into_iter().collect()));
            }
            (Ok(()), Err(err)) => return Err(err),
            (Ok(()), Ok(())) => {}
        }

        let container = self.apply(
            Container::new(&request.container_name, &bootstrap_image)?
                .with_shared_host_netns(true),
        )?;
        let options = RunOptions {
            cwd: self.cwd.clone(),
            env: env::session_env(&self.env, extra_env, context),
            terminal: self.terminal,
            user: (0, 0),
        };

        let guard = privileges.elevate()?;
        let (uid, gid) = guard.unprivileged_user();
        let result = (|| -> KilnResult<()> {
            let mut session =
                ContainerSession::open(container, &paths.containers(), Arc::clone(runner))?;
            if let Some(launcher) = &self.launcher {
                session.set_launcher(launcher.clone());
            }
            let body = (|| -> KilnResult<()> {
                // Marker file so scripts can detect they run inside an SDK.
                session.run(
                    &["sh".to_owned(), "-c".to_owned(), "> /.sdk".to_owned()],
                    &options,
                )?;
                Self::run_pipeline(&mut session, &self.prelude_commands, &options, "prelude")?;
                for command in &request.steps {
                    tracing::info!(%command, "running bootstrap step");
                    session.run(&cmdline::split(command)?, &options)?;
                }
                Self::run_pipeline(&mut session, &self.postlude_commands, &options, "postlude")?;
                session.snapshot(&request.output_image)?;
                privileges::chown(&request.output_image, uid, gid)
            })();
            let close_result = session.close();
            match (body, close_result) {
                (Ok(()), Ok(())) => Ok(()),
                (Ok(()), Err(err)) | (Err(err), Ok(())) => Err(err),
                (Err(body_err), Err(close_err)) => Err(body_err.with_related(vec![close_err])),
            }
        })();
        let release_result = guard.release();
        match (result, release_result) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(err)) | (Err(err), Ok(())) => Err(err),
            (Err(err), Err(release_err)) => Err(err.with_related(vec![release_err])),
        }
    }

    fn stage_bootstrap_image(
        privileges: &PrivilegeContext,
        archive: &Path,
        contents_dir: &Path,
        image: &Path,
        runner: &Arc<dyn CommandRunner>,
    ) -> KilnResult<()> {
        let guard = privileges.elevate()?;
        let result = (|| -> KilnResult<()> {
            extract_rootfs_archive(archive, contents_dir)?;
            mksquashfs(image, contents_dir, &MksquashfsOptions::snapshot(), &**runner)?;
            let (uid, gid) = guard.unprivileged_user();
            privileges::chown(image, uid, gid)
        })();
        let release_result = guard.release();
        match (result, release_result) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(err)) | (Err(err), Ok(())) => Err(err),
            (Err(err), Err(release_err)) => Err(err.with_related(vec![release_err])),
        }
    }

    fn wipe_elevated(privileges: &PrivilegeContext, dir: &Path) -> KilnResult<()> {
        let guard = privileges.elevate()?;
        let result = std::fs::remove_dir_all(dir).map_err(KilnError::Io);
        let release_result = guard.release();
        match (result, release_result) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(err)) | (Err(err), Ok(())) => Err(err),
            (Err(err), Err(release_err)) => Err(err.with_related(vec![release_err])),
        }
    }

    fn run_pipeline(
        session: &mut ContainerSession,
        commands: &[String],
        options: &RunOptions,
        stage: &str,
    ) -> KilnResult<()> {
        for command in commands {
            tracing::debug!(%command, stage, "running pipeline command");
            session.run(&cmdline::split(command)?, options)?;
        }
        Ok(())
    }
}

/// Inputs of one SDK bootstrap.
#[derive(Debug, Clone)]
pub struct BootstrapRequest {
    /// Name for the bootstrap container (and its launcher instances).
    pub container_name: String,
    /// Rootfs tar archive (plain or gzip-compressed).
    pub rootfs_archive: PathBuf,
    /// Where to write the final SDK squashfs image.
    pub output_image: PathBuf,
    /// Bootstrap commands run between prelude and postlude. May be empty.
    pub steps: Vec<String>,
}

/// An open SDK session: one container session plus the fixed
/// cwd/env/terminal execution policy.
#[derive(Debug)]
pub struct SdkSession {
    session: ContainerSession,
    options: RunOptions,
    postlude_commands: Vec<String>,
    closed: bool,
}

impl SdkSession {
    /// Run a command line in the session with the fixed policy.
    ///
    /// # Errors
    ///
    /// [`KilnError::Validation`] for an empty or unsplittable command
    /// line; otherwise whatever the container session reports.
    pub fn run(&mut self, command_line: &str) -> KilnResult<()> {
        let argv = cmdline::split(command_line)?;
        if argv.is_empty() {
            return Err(KilnError::validation("cannot run an empty command line"));
        }
        self.session.run(&argv, &self.options)
    }

    /// Snapshot the session rootfs into a squashfs image.
    ///
    /// # Errors
    ///
    /// See [`ContainerSession::snapshot`].
    pub fn snapshot(&self, output_image: &Path) -> KilnResult<()> {
        self.session.snapshot(output_image)
    }

    /// The underlying container session.
    #[must_use]
    pub const fn container_session(&self) -> &ContainerSession {
        &self.session
    }

    /// Run the postlude commands in order, then close the container
    /// session. Idempotent.
    ///
    /// A postlude failure does not prevent the container teardown; when
    /// both fail, the postlude failure stays primary with the teardown
    /// failure attached.
    ///
    /// # Errors
    ///
    /// Postlude and teardown failures, combined as above.
    pub fn close(&mut self) -> KilnResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut postlude_result = Ok(());
        for command in &self.postlude_commands {
            tracing::debug!(%command, "running postlude command");
            let outcome = cmdline::split(command)
                .and_then(|argv| self.session.run(&argv, &self.options));
            if let Err(err) = outcome {
                postlude_result = Err(err);
                break;
            }
        }

        let close_result = self.session.close();
        match (postlude_result, close_result) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(err)) | (Err(err), Ok(())) => Err(err),
            (Err(postlude_err), Err(close_err)) => {
                Err(postlude_err.with_related(vec![close_err]))
            }
        }
    }
}

impl Drop for SdkSession {
    fn drop(&mut self) {
        if !self.closed {
            // The container session tears its own mounts down on drop;
            // only the postludes cannot be replayed here.
            tracing::warn!("sdk session dropped while open; postlude commands were not run");
        }
    }
}

fn extract_rootfs_archive(archive_path: &Path, destination: &Path) -> KilnResult<()> {
    let mut probe = std::fs::File::open(archive_path).map_err(|err| {
        KilnError::environment(format!(
            "cannot open rootfs archive {}: {err}",
            archive_path.display()
        ))
    })?;
    let mut magic = [0u8; 2];
    let read = probe.read(&mut magic)?;
    drop(probe);

    let file = std::fs::File::open(archive_path)?;
    let reader: Box<dyn Read> = if read == 2 && magic == [0x1f, 0x8b] {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    let mut archive = tar::Archive::new(std::io::BufReader::new(reader));
    // Ownership must survive the extraction: the rootfs carries uid 0
    // files that the container relies on.
    archive.set_preserve_permissions(true);
    archive.set_preserve_ownerships(true);
    archive.set_unpack_xattrs(true);
    archive.unpack(destination)?;
    tracing::debug!(
        archive = %archive_path.display(),
        destination = %destination.display(),
        "rootfs archive extracted"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_common::exec::testing::ScriptedRunner;

    fn scripted_rw_assembly(runner: &ScriptedRunner, image: &str) {
        runner.enqueue_output("losetup", "");
        runner.enqueue_output("losetup", &format!("/dev/loop5 {image} 1\n"));
    }

    fn open_args() -> (BuildContext, BTreeMap<String, String>) {
        (BuildContext::default(), BTreeMap::new())
    }

    #[test]
    fn prelude_commands_run_in_order_on_open() {
        let runner = Arc::new(ScriptedRunner::new());
        scripted_rw_assembly(&runner, "/images/sdk.squashfs");
        let runtime = tempfile::tempdir().unwrap();
        let sdk = Sdk::new()
            .with_launcher("/opt/runc")
            .with_prelude_commands(vec!["ldconfig".to_owned(), "env-update".to_owned()]);
        let container = Container::new("sdk.build", "/images/sdk.squashfs").unwrap();
        let (context, extra) = open_args();

        let mut session = sdk
            .open(container, &context, &extra, runtime.path(), runner.clone())
            .unwrap();

        let launches: Vec<String> = runner
            .command_lines()
            .iter()
            .filter(|line| line.starts_with("/opt/runc run"))
            .cloned()
            .collect();
        assert_eq!(launches.len(), 2);

        // The runtime spec of the last prelude command is on disk.
        let config = std::fs::read_to_string(
            session.container_session().bundle_dir().join("config.json"),
        )
        .unwrap();
        assert!(config.contains("env-update"));

        session.close().unwrap();
    }

    #[test]
    fn prelude_failure_aborts_entry_and_tears_down() {
        let runner = Arc::new(ScriptedRunner::new());
        scripted_rw_assembly(&runner, "/images/sdk.squashfs");
        runner.enqueue_failure("/opt/runc", "returned exit status 1");
        let runtime = tempfile::tempdir().unwrap();
        let sdk = Sdk::new()
            .with_launcher("/opt/runc")
            .with_prelude_commands(vec!["broken-prelude".to_owned()]);
        let container = Container::new("sdk.build", "/images/sdk.squashfs").unwrap();
        let (context, extra) = open_args();

        let err = sdk
            .open(container, &context, &extra, runtime.path(), runner.clone())
            .unwrap_err();
        assert!(matches!(err, KilnError::SystemCommand(_)));

        // The mount stack was released: the loop device set up during
        // entry was detached again.
        assert!(
            runner
                .command_lines()
                .iter()
                .any(|line| line.starts_with("losetup -d"))
        );
    }

    #[test]
    fn postludes_run_even_when_the_body_failed() {
        let runner = Arc::new(ScriptedRunner::new());
        scripted_rw_assembly(&runner, "/images/sdk.squashfs");
        let runtime = tempfile::tempdir().unwrap();
        let sdk = Sdk::new()
            .with_launcher("/opt/runc")
            .with_postlude_commands(vec!["save-logs".to_owned()]);
        let container = Container::new("sdk.build", "/images/sdk.squashfs").unwrap();
        let (context, extra) = open_args();

        let err = sdk
            .with_session(
                container,
                &context,
                &extra,
                runtime.path(),
                runner.clone(),
                |_session| -> KilnResult<()> {
                    Err(KilnError::validation("body gave up"))
                },
            )
            .unwrap_err();

        // The body error is primary.
        assert!(matches!(err, KilnError::Validation { .. }));
        // The postlude still ran.
        assert_eq!(
            runner
                .command_lines()
                .iter()
                .filter(|line| line.starts_with("/opt/runc run"))
                .count(),
            1
        );
    }

    #[test]
    fn postlude_failure_does_not_erase_the_body_failure() {
        let runner = Arc::new(ScriptedRunner::new());
        scripted_rw_assembly(&runner, "/images/sdk.squashfs");
        runner.enqueue_failure("/opt/runc", "postlude exploded");
        let runtime = tempfile::tempdir().unwrap();
        let sdk = Sdk::new()
            .with_launcher("/opt/runc")
            .with_postlude_commands(vec!["save-logs".to_owned()]);
        let container = Container::new("sdk.build", "/images/sdk.squashfs").unwrap();
        let (context, extra) = open_args();

        let err = sdk
            .with_session(
                container,
                &context,
                &extra,
                runtime.path(),
                runner,
                |_session| -> KilnResult<()> {
                    Err(KilnError::validation("body gave up"))
                },
            )
            .unwrap_err();

        match err {
            KilnError::Compound { primary, related } => {
                assert!(matches!(*primary, KilnError::Validation { .. }));
                assert!(!related.is_empty());
            }
            other => panic!("expected the body failure to stay primary, got {other}"),
        }
    }

    #[test]
    fn extra_capabilities_and_devices_reach_the_spec() {
        let runner = Arc::new(ScriptedRunner::new());
        scripted_rw_assembly(&runner, "/images/sdk.squashfs");
        let runtime = tempfile::tempdir().unwrap();
        let sdk = Sdk::new()
            .with_launcher("/opt/runc")
            .with_additional_capabilities(vec!["CAP_SYS_ADMIN".to_owned()])
            .with_additional_device_bindings(vec![PathBuf::from("/dev/null")]);
        let container = Container::new("sdk.build", "/images/sdk.squashfs").unwrap();
        let (context, extra) = open_args();

        let mut session = sdk
            .open(container, &context, &extra, runtime.path(), runner)
            .unwrap();
        session.run("true").unwrap();

        let config = std::fs::read_to_string(
            session.container_session().bundle_dir().join("config.json"),
        )
        .unwrap();
        assert!(config.contains("CAP_SYS_ADMIN"));
        assert!(config.contains("/dev/null"));
        // SDK sessions keep both tmp trees on dedicated tmpfs mounts.
        assert!(config.contains("\"/tmp\""));
        assert!(config.contains("\"/var/tmp\""));
        session.close().unwrap();
    }
}
