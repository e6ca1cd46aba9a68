//! Linux kernel version probing.

use crate::error::{KilnError, KilnResult};

/// Where the kernel publishes its release string.
const OSRELEASE: &str = "/proc/sys/kernel/osrelease";

/// Returns the running kernel version as a `(major, minor, micro)` triple,
/// e.g. `(4, 16, 12)` on a `4.16.12-1-ARCH` kernel.
///
/// # Errors
///
/// [`KilnError::Environment`] when the release string cannot be read or
/// parsed (e.g. not running on Linux).
pub fn kernel_version() -> KilnResult<(u32, u32, u32)> {
    let release = std::fs::read_to_string(OSRELEASE).map_err(|err| {
        KilnError::environment(format!("cannot read {OSRELEASE}: {err}"))
    })?;
    parse_release(release.trim()).ok_or_else(|| {
        KilnError::environment(format!(
            "unexpected kernel release string {:?}",
            release.trim()
        ))
    })
}

/// Parse a kernel release string into its numeric components. The micro
/// component defaults to zero when absent; any trailing suffix (local
/// version, flavor) is ignored.
#[must_use]
pub fn parse_release(release: &str) -> Option<(u32, u32, u32)> {
    let mut parts = release.splitn(3, '.');
    let major: u32 = parts.next()?.parse().ok()?;
    let minor: u32 = take_leading_digits(parts.next()?)?;
    let micro = parts.next().and_then(take_leading_digits).unwrap_or(0);
    Some((major, minor, micro))
}

fn take_leading_digits(s: &str) -> Option<u32> {
    let digits: String = s.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}
