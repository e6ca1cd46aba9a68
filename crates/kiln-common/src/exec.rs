//! External command execution.
//!
//! Everything kiln does to the kernel goes through command line utilities
//! (`mount(8)`, `losetup(8)`, `mksquashfs`, the OCI launcher). This module
//! provides the single place where those processes are spawned, with output
//! capture and timeouts, behind a [`CommandRunner`] trait so the mount and
//! session logic can be exercised in tests without touching the system.

use std::io::{Read, Seek, SeekFrom};
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use crate::cmdline;
use crate::error::{KilnError, KilnResult, SystemCommandError};

/// Poll interval while waiting on a timed command.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Runs external commands on behalf of the mount and session layers.
pub trait CommandRunner {
    /// Run a command to completion, capturing stdout and stderr interleaved
    /// into one buffer (as they would appear in an interactive shell).
    ///
    /// # Errors
    ///
    /// [`KilnError::Environment`] if the program is not in `PATH`,
    /// [`KilnError::SystemCommand`] on non-zero exit or timeout (carrying
    /// the captured output).
    fn run_captured(&self, argv: &[String], timeout: Option<Duration>) -> KilnResult<String>;

    /// Run a command attached to the caller's stdout/stderr. When
    /// `interactive` is set, stdin is forwarded as well (terminal
    /// sessions); otherwise the command reads from `/dev/null`.
    ///
    /// # Errors
    ///
    /// Same taxonomy as [`CommandRunner::run_captured`], without captured
    /// output.
    fn run_attached(
        &self,
        argv: &[String],
        timeout: Option<Duration>,
        interactive: bool,
    ) -> KilnResult<()>;
}

/// Checks whether the current process is attached to a terminal (stdin,
/// stdout and stderr all are).
#[must_use]
pub fn is_tty_attached() -> bool {
    rustix::termios::isatty(std::io::stdin())
        && rustix::termios::isatty(std::io::stdout())
        && rustix::termios::isatty(std::io::stderr())
}

/// The real [`CommandRunner`], backed by [`std::process::Command`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl SystemRunner {
    /// Create a runner.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Wait for `child`, killing it when `timeout` expires.
    ///
    /// Returns `Ok(None)` when the command was killed on timeout.
    fn wait(
        child: &mut std::process::Child,
        timeout: Option<Duration>,
    ) -> KilnResult<Option<ExitStatus>> {
        let Some(limit) = timeout else {
            return Ok(Some(child.wait()?));
        };
        let deadline = Instant::now() + limit;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                // The process is past its deadline; reap it so no zombie
                // outlives the error we are about to report.
                let _ = child.kill();
                let _ = child.wait();
                return Ok(None);
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    fn spawn_error(argv: &[String], err: &std::io::Error) -> KilnError {
        if err.kind() == std::io::ErrorKind::NotFound {
            KilnError::environment(format!("command {:?} not found in PATH", argv[0]))
        } else {
            SystemCommandError::new(cmdline::render(argv), format!("failed to spawn: {err}"))
                .into()
        }
    }

    fn exit_reason(status: ExitStatus) -> String {
        status.code().map_or_else(
            || format!("terminated abnormally ({status})"),
            |code| format!("returned exit status {code}"),
        )
    }
}

impl CommandRunner for SystemRunner {
    fn run_captured(&self, argv: &[String], timeout: Option<Duration>) -> KilnResult<String> {
        let (program, args) = split_argv(argv)?;
        tracing::debug!(command = %cmdline::render(argv), "running command (captured)");

        // One unlinked temporary file receives both streams, so the capture
        // interleaves exactly as a shell would show it.
        let sink = tempfile::tempfile()?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(sink.try_clone()?))
            .stderr(Stdio::from(sink.try_clone()?))
            .spawn()
            .map_err(|err| Self::spawn_error(argv, &err))?;

        let status = Self::wait(&mut child, timeout)?;

        let mut sink = sink;
        sink.seek(SeekFrom::Start(0))?;
        let mut output = String::new();
        sink.read_to_string(&mut output)?;

        match status {
            None => Err(SystemCommandError::new(
                cmdline::render(argv),
                format!("timed out after {} s", timeout.unwrap_or_default().as_secs()),
            )
            .with_combined(output)
            .into()),
            Some(status) if !status.success() => Err(SystemCommandError::new(
                cmdline::render(argv),
                Self::exit_reason(status),
            )
            .with_combined(output)
            .into()),
            Some(_) => Ok(output),
        }
    }

    fn run_attached(
        &self,
        argv: &[String],
        timeout: Option<Duration>,
        interactive: bool,
    ) -> KilnResult<()> {
        let (program, args) = split_argv(argv)?;
        tracing::debug!(
            command = %cmdline::render(argv),
            interactive,
            "running command (attached)"
        );

        let stdin = if interactive {
            Stdio::inherit()
        } else {
            Stdio::null()
        };
        let mut child = Command::new(program)
            .args(args)
            .stdin(stdin)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|err| Self::spawn_error(argv, &err))?;

        match Self::wait(&mut child, timeout)? {
            None => Err(SystemCommandError::new(
                cmdline::render(argv),
                format!("timed out after {} s", timeout.unwrap_or_default().as_secs()),
            )
            .into()),
            Some(status) if !status.success() => Err(SystemCommandError::new(
                cmdline::render(argv),
                Self::exit_reason(status),
            )
            .into()),
            Some(_) => Ok(()),
        }
    }
}

fn split_argv(argv: &[String]) -> KilnResult<(&String, &[String])> {
    argv.split_first()
        .ok_or_else(|| KilnError::validation("cannot run an empty command line"))
}

pub mod testing {
    //! A scripted [`CommandRunner`] for tests: records every invocation and
    //! replays canned outputs or injected failures, keyed by program name.

    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::CommandRunner;
    use crate::cmdline;
    use crate::error::{KilnResult, SystemCommandError};

    enum Scripted {
        Output(String),
        Failure(String),
    }

    /// Recording command runner with per-program scripted responses.
    ///
    /// Unscripted invocations succeed with empty output, so most tests only
    /// script the calls they care about.
    #[derive(Default)]
    pub struct ScriptedRunner {
        calls: Mutex<Vec<Vec<String>>>,
        responses: Mutex<HashMap<String, VecDeque<Scripted>>>,
    }

    impl ScriptedRunner {
        /// Create an empty scripted runner.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue a successful captured output for the next run of `program`.
        pub fn enqueue_output(&self, program: &str, output: &str) {
            self.responses
                .lock()
                .expect("runner state poisoned")
                .entry(program.to_owned())
                .or_default()
                .push_back(Scripted::Output(output.to_owned()));
        }

        /// Queue a failure (with the given reason) for the next run of
        /// `program`.
        pub fn enqueue_failure(&self, program: &str, reason: &str) {
            self.responses
                .lock()
                .expect("runner state poisoned")
                .entry(program.to_owned())
                .or_default()
                .push_back(Scripted::Failure(reason.to_owned()));
        }

        /// Every argv this runner has executed, in order.
        #[must_use]
        pub fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().expect("runner state poisoned").clone()
        }

        /// The executed command lines, rendered for easy assertions.
        #[must_use]
        pub fn command_lines(&self) -> Vec<String> {
            self.calls().iter().map(|argv| cmdline::render(argv)).collect()
        }

        fn record_and_reply(&self, argv: &[String]) -> KilnResult<String> {
            self.calls
                .lock()
                .expect("runner state poisoned")
                .push(argv.to_vec());
            let scripted = self
                .responses
                .lock()
                .expect("runner state poisoned")
                .get_mut(argv.first().map_or("", String::as_str))
                .and_then(VecDeque::pop_front);
            match scripted {
                Some(Scripted::Output(output)) => Ok(output),
                Some(Scripted::Failure(reason)) => {
                    Err(SystemCommandError::new(cmdline::render(argv), reason).into())
                }
                None => Ok(String::new()),
            }
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run_captured(&self, argv: &[String], _timeout: Option<Duration>) -> KilnResult<String> {
            self.record_and_reply(argv)
        }

        fn run_attached(
            &self,
            argv: &[String],
            _timeout: Option<Duration>,
            _interactive: bool,
        ) -> KilnResult<()> {
            self.record_and_reply(argv).map(|_| ())
        }
    }
}
