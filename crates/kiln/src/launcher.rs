//! External OCI launcher discovery.

use std::path::PathBuf;

use kiln_common::error::{KilnError, KilnResult};

/// Launcher binaries probed in order.
pub const LAUNCHER_CANDIDATES: &[&str] = &["runc", "docker-runc"];

/// Locate the OCI launcher binary in `PATH`.
///
/// # Errors
///
/// [`KilnError::Environment`] when none of the candidates is installed.
pub fn find_launcher() -> KilnResult<PathBuf> {
    for candidate in LAUNCHER_CANDIDATES {
        if let Ok(path) = which::which(candidate) {
            tracing::debug!(launcher = %path.display(), "container launcher found");
            return Ok(path);
        }
    }
    Err(KilnError::environment(format!(
        "cannot find any container launcher ({}) in PATH",
        LAUNCHER_CANDIDATES.join(", ")
    )))
}
