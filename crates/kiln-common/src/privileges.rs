#![allow(unsafe_code)]
//! Privilege lowering and scoped elevation.
//!
//! Kiln runs as an unprivileged user and flips to root only around the
//! operations that need it (mounting, loop device binding, ownership
//! changes). The flip relies on the saved-set uid/gid staying root after
//! the process lowered its real and effective identity at startup, so a
//! later `setresuid(0, 0, uid)` is permitted without any capability.
//!
//! Elevation is single-depth: the identity flip is process-wide state and
//! nesting it would make the restore ambiguous.

use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::error::{KilnError, KilnResult};

/// Umask applied while elevated, suitable for root-owned artifact creation.
const ROOT_UMASK: libc::mode_t = 0o022;

fn errno_message(what: &str) -> String {
    format!("{what}: {}", std::io::Error::last_os_error())
}

/// The unprivileged identity this process operates as, configured once at
/// startup (never implied by module load order).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrivilegeContext {
    uid: libc::uid_t,
    gid: libc::gid_t,
}

impl PrivilegeContext {
    /// Describe the unprivileged identity without touching process state.
    #[must_use]
    pub const fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    /// The unprivileged uid.
    #[must_use]
    pub const fn uid(&self) -> u32 {
        self.uid
    }

    /// The unprivileged gid.
    #[must_use]
    pub const fn gid(&self) -> u32 {
        self.gid
    }

    /// Lower the process to the unprivileged identity, keeping root in the
    /// saved-set slots so [`PrivilegeContext::elevate`] works later.
    ///
    /// Intended to be called exactly once, as early as possible in process
    /// startup, while real and effective ids are still root.
    ///
    /// # Errors
    ///
    /// [`KilnError::Environment`] when the target user has no passwd entry,
    /// [`KilnError::Privilege`] when any of the id changes fails.
    pub fn lower(&self) -> KilnResult<()> {
        // Reset supplementary groups to those of the target user first;
        // once the uid changed this is no longer permitted.
        let pw = unsafe { libc::getpwuid(self.uid) };
        if pw.is_null() {
            return Err(KilnError::environment(format!(
                "no passwd entry for uid {}",
                self.uid
            )));
        }
        let name = unsafe { CStr::from_ptr((*pw).pw_name) };
        if unsafe { libc::initgroups(name.as_ptr(), self.gid) } != 0 {
            return Err(KilnError::privilege(errno_message(
                "failed to reset supplementary groups",
            )));
        }
        // GID before UID, the other way around loses the right to change it.
        if unsafe { libc::setresgid(self.gid, self.gid, 0) } != 0 {
            return Err(KilnError::privilege(errno_message("setresgid failed")));
        }
        if unsafe { libc::setresuid(self.uid, self.uid, 0) } != 0 {
            return Err(KilnError::privilege(errno_message("setresuid failed")));
        }
        tracing::debug!(uid = self.uid, gid = self.gid, "lowered process privileges");
        Ok(())
    }

    /// Whether a privilege flip is currently possible: the saved-set ids
    /// are root while the real and effective ids are not.
    #[must_use]
    pub fn possible() -> bool {
        let (mut ruid, mut euid, mut suid) = (0, 0, 0);
        let (mut rgid, mut egid, mut sgid) = (0, 0, 0);
        unsafe {
            libc::getresuid(&mut ruid, &mut euid, &mut suid);
            libc::getresgid(&mut rgid, &mut egid, &mut sgid);
        }
        suid == 0 && sgid == 0 && ruid != 0 && euid != 0 && rgid != 0 && egid != 0
    }

    /// Elevate to root until the returned guard is released (or dropped).
    ///
    /// Returns a guard exposing the unprivileged `(uid, gid)` that were in
    /// effect before the flip. The umask is tightened while elevated and
    /// restored on release.
    ///
    /// # Errors
    ///
    /// [`KilnError::Privilege`] when the effective identity is already root
    /// (nested elevations are unsupported) or when an id change fails.
    pub fn elevate(&self) -> KilnResult<ElevatedGuard> {
        let euid = unsafe { libc::geteuid() };
        let egid = unsafe { libc::getegid() };
        if euid == 0 || egid == 0 {
            return Err(KilnError::privilege(
                "nested privilege elevations do not work",
            ));
        }
        // GID before UID here as well.
        if unsafe { libc::setresgid(0, 0, egid) } != 0 {
            return Err(KilnError::privilege(errno_message("setresgid failed")));
        }
        if unsafe { libc::setresuid(0, 0, euid) } != 0 {
            let err = KilnError::privilege(errno_message("setresuid failed"));
            // Undo the gid flip so a failed elevation leaves no half state.
            if unsafe { libc::setresgid(egid, egid, 0) } != 0 {
                tracing::error!("failed to roll back setresgid after failed elevation");
            }
            return Err(err);
        }
        let prior_umask = unsafe { libc::umask(ROOT_UMASK) };
        tracing::debug!(uid = euid, gid = egid, "elevated to root");
        Ok(ElevatedGuard {
            unprivileged: (euid, egid),
            prior_umask,
            restored: false,
        })
    }
}

/// Scope guard for an elevation; restores the unprivileged identity and the
/// prior umask when released or dropped.
#[derive(Debug)]
pub struct ElevatedGuard {
    unprivileged: (libc::uid_t, libc::gid_t),
    prior_umask: libc::mode_t,
    restored: bool,
}

impl ElevatedGuard {
    /// The unprivileged `(uid, gid)` captured when elevating.
    #[must_use]
    pub const fn unprivileged_user(&self) -> (u32, u32) {
        self.unprivileged
    }

    /// Restore the unprivileged identity explicitly, surfacing any failure.
    ///
    /// # Errors
    ///
    /// [`KilnError::Privilege`] when an id change fails.
    pub fn release(mut self) -> KilnResult<()> {
        self.restore()
    }

    fn restore(&mut self) -> KilnResult<()> {
        if self.restored {
            return Ok(());
        }
        self.restored = true;
        unsafe { libc::umask(self.prior_umask) };
        // Read the identity back from the saved-set slots rather than the
        // captured values, tolerating changes made while elevated.
        let (mut ruid, mut euid, mut suid) = (0, 0, 0);
        let (mut rgid, mut egid, mut sgid) = (0, 0, 0);
        unsafe {
            libc::getresuid(&mut ruid, &mut euid, &mut suid);
            libc::getresgid(&mut rgid, &mut egid, &mut sgid);
        }
        if unsafe { libc::setresuid(suid, suid, 0) } != 0 {
            return Err(KilnError::privilege(errno_message(
                "failed to restore unprivileged uid",
            )));
        }
        if unsafe { libc::setresgid(sgid, sgid, 0) } != 0 {
            return Err(KilnError::privilege(errno_message(
                "failed to restore unprivileged gid",
            )));
        }
        tracing::debug!(uid = suid, gid = sgid, "restored unprivileged identity");
        Ok(())
    }
}

impl Drop for ElevatedGuard {
    fn drop(&mut self) {
        if let Err(err) = self.restore() {
            // Never panic on the unwind path; the failure is still visible.
            tracing::error!(error = %err, "failed to restore privileges on drop");
        }
    }
}

/// Change ownership of a root-created artifact, typically to hand a
/// snapshot or image back to the unprivileged user while still elevated.
///
/// # Errors
///
/// [`KilnError::Validation`] for paths containing NUL bytes,
/// [`KilnError::Io`] when `chown(2)` fails.
pub fn chown(path: &Path, uid: u32, gid: u32) -> KilnResult<()> {
    let raw = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| KilnError::validation(format!("path {} contains a NUL byte", path.display())))?;
    if unsafe { libc::chown(raw.as_ptr(), uid, gid) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}
