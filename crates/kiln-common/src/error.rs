//! Common error types for the kiln toolkit.

use std::fmt;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`KilnError`].
pub type KilnResult<T> = Result<T, KilnError>;

/// Errors raised across the kiln toolkit.
///
/// The taxonomy is deliberate: validation problems are caught before any
/// side effect, environment problems before the affected resource is
/// touched, and external command failures carry enough captured context to
/// diagnose without re-running.
#[derive(Error, Diagnostic, Debug)]
pub enum KilnError {
    /// Malformed input caught before any system call was issued.
    #[error("invalid input: {message}")]
    #[diagnostic(code(kiln::validation))]
    Validation {
        /// What was wrong with the input.
        message: String,
    },

    /// The host environment does not meet a requirement (missing utility,
    /// unsupported kernel feature, missing user database entry).
    #[error("unsuitable environment: {message}")]
    #[diagnostic(code(kiln::environment))]
    Environment {
        /// The unmet requirement.
        message: String,
    },

    /// An external command exited non-zero, timed out or could not run.
    #[error(transparent)]
    #[diagnostic(transparent)]
    SystemCommand(#[from] SystemCommandError),

    /// Snapshotting a container rootfs failed or was not permitted.
    #[error("snapshot failed: {message}")]
    #[diagnostic(code(kiln::snapshot))]
    Snapshot {
        /// Why the snapshot could not be produced.
        message: String,
        /// The underlying failure, when the compression step itself failed.
        #[source]
        source: Option<Box<KilnError>>,
    },

    /// An operation was attempted outside of its valid session state.
    #[error("cannot {operation}: session is {state}")]
    #[diagnostic(code(kiln::session_state))]
    SessionState {
        /// The operation that was attempted.
        operation: String,
        /// The state the session was in.
        state: String,
    },

    /// Misuse or failure of the privilege elevation machinery.
    #[error("privilege operation failed: {message}")]
    #[diagnostic(
        code(kiln::privileges),
        help("the process must start with root as its saved-set identity")
    )]
    Privilege {
        /// What went wrong.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(kiln::io))]
    Io(#[from] std::io::Error),

    /// A primary error accompanied by failures observed while winding down
    /// resources that were already acquired. The primary error is never
    /// replaced by a cleanup failure; cleanup failures ride along.
    #[error("{primary} ({} wind-down failure(s) attached)", .related.len())]
    #[diagnostic(code(kiln::compound))]
    Compound {
        /// The error that triggered the wind-down.
        primary: Box<KilnError>,
        /// Failures observed while releasing already-acquired resources.
        #[related]
        related: Vec<KilnError>,
    },
}

impl KilnError {
    /// Build a [`KilnError::Validation`].
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Build a [`KilnError::Environment`].
    pub fn environment(message: impl Into<String>) -> Self {
        Self::Environment {
            message: message.into(),
        }
    }

    /// Build a [`KilnError::Snapshot`] without an underlying cause.
    pub fn snapshot(message: impl Into<String>) -> Self {
        Self::Snapshot {
            message: message.into(),
            source: None,
        }
    }

    /// Build a [`KilnError::SessionState`].
    pub fn session_state(operation: impl Into<String>, state: impl Into<String>) -> Self {
        Self::SessionState {
            operation: operation.into(),
            state: state.into(),
        }
    }

    /// Build a [`KilnError::Privilege`].
    pub fn privilege(message: impl Into<String>) -> Self {
        Self::Privilege {
            message: message.into(),
        }
    }

    /// Attach wind-down failures to this error, keeping it primary.
    ///
    /// Returns `self` unchanged when `related` is empty.
    #[must_use]
    pub fn with_related(self, related: Vec<KilnError>) -> Self {
        if related.is_empty() {
            self
        } else {
            Self::Compound {
                primary: Box::new(self),
                related,
            }
        }
    }
}

/// Fold a list of wind-down failures into a single reportable error.
///
/// With no prior error in flight, the first failure becomes the primary
/// error and any remaining ones are attached to it.
#[must_use]
pub fn fold_failures(mut failures: Vec<KilnError>) -> Option<KilnError> {
    if failures.is_empty() {
        return None;
    }
    let primary = failures.remove(0);
    Some(primary.with_related(failures))
}

/// Failure of an external command (`mount(8)`, `losetup(8)`, the image
/// compressor, the container launcher, ...).
///
/// Carries the quoted command line, the reason for the failure and whatever
/// output was captured, so the failure can be diagnosed without re-running.
#[derive(Debug, Diagnostic)]
#[diagnostic(code(kiln::system_command))]
pub struct SystemCommandError {
    /// The command line, shell-quoted for display.
    pub command: String,
    /// Why the command failed (exit status, timeout, ...).
    pub reason: String,
    /// Captured standard output, when streams were captured separately.
    pub stdout: Option<String>,
    /// Captured standard error, when streams were captured separately.
    pub stderr: Option<String>,
    /// Captured interleaved output, when both streams shared one sink.
    pub combined: Option<String>,
}

impl SystemCommandError {
    /// Build an error with no captured output.
    pub fn new(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            reason: reason.into(),
            stdout: None,
            stderr: None,
            combined: None,
        }
    }

    /// Attach interleaved captured output.
    #[must_use]
    pub fn with_combined(mut self, combined: impl Into<String>) -> Self {
        self.combined = Some(combined.into());
        self
    }
}

impl fmt::Display for SystemCommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "command {:?} failed: {}", self.command, self.reason)?;
        if let Some(stdout) = &self.stdout {
            write!(f, "\n v-- stdout --v\n{stdout}\n ^-- end of stdout --^")?;
        }
        if let Some(stderr) = &self.stderr {
            write!(f, "\n v-- stderr --v\n{stderr}\n ^-- end of stderr --^")?;
        }
        if let Some(combined) = &self.combined {
            write!(f, "\n v-- output --v\n{combined}\n ^-- end of output --^")?;
        }
        Ok(())
    }
}

impl std::error::Error for SystemCommandError {}
