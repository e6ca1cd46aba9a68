//! Loop device management through `losetup(8)`.
//!
//! A [`LoopDevice`] attaches a regular file as a block device node. When
//! the node is not chosen by the caller, the one assigned by the kernel is
//! discovered by re-scanning the live loop device table and matching on
//! the resolved backing file path.

use std::path::{Path, PathBuf};

use kiln_common::error::{KilnError, KilnResult, SystemCommandError};
use kiln_common::exec::CommandRunner;
use kiln_common::cmdline;

use crate::ADMIN_CMD_TIMEOUT;

/// A loop device binding between a backing file and a device node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopDevice {
    backing_file: PathBuf,
    device: Option<PathBuf>,
    read_only: bool,
}

impl LoopDevice {
    /// Describe a binding for `backing_file`, letting the kernel pick a
    /// free device node on attach.
    #[must_use]
    pub fn new(backing_file: impl Into<PathBuf>, read_only: bool) -> Self {
        Self {
            backing_file: absolute(backing_file.into()),
            device: None,
            read_only,
        }
    }

    /// Pin the binding to a specific device node instead of letting the
    /// kernel pick one.
    #[must_use]
    pub fn with_device(mut self, device: impl Into<PathBuf>) -> Self {
        self.device = Some(absolute(device.into()));
        self
    }

    /// The backing file.
    #[must_use]
    pub fn backing_file(&self) -> &Path {
        &self.backing_file
    }

    /// The device node, once attached (or when pinned).
    #[must_use]
    pub fn device(&self) -> Option<&Path> {
        self.device.as_deref()
    }

    /// Whether the binding is read-only.
    #[must_use]
    pub const fn read_only(&self) -> bool {
        self.read_only
    }

    /// Attach the backing file, returning the device node in use.
    ///
    /// When no node was pinned, the node assigned by the kernel is found
    /// by re-scanning the loop device table for a unique backing-file
    /// match.
    ///
    /// # Errors
    ///
    /// [`KilnError::SystemCommand`] when `losetup` fails,
    /// [`KilnError::Environment`] when the assigned node cannot be
    /// identified unambiguously after the attach.
    pub fn attach(&mut self, runner: &dyn CommandRunner) -> KilnResult<PathBuf> {
        let mut argv = vec!["losetup".to_owned()];
        if self.read_only {
            argv.push("-r".to_owned());
        }
        match &self.device {
            Some(device) => argv.push(device.display().to_string()),
            None => argv.push("-f".to_owned()),
        }
        argv.push(self.backing_file.display().to_string());
        runner.run_captured(&argv, Some(ADMIN_CMD_TIMEOUT))?;

        let device = match self.device.clone() {
            Some(device) => device,
            None => {
                // The node choice was left to losetup; find out which one
                // it picked. Nothing can be detached safely when this
                // fails, as the node is exactly what we do not know.
                let device = self.discover_device(runner)?;
                self.device = Some(device.clone());
                device
            }
        };
        tracing::debug!(
            backing_file = %self.backing_file.display(),
            device = %device.display(),
            read_only = self.read_only,
            "loop device attached"
        );
        Ok(device)
    }

    fn discover_device(&self, runner: &dyn CommandRunner) -> KilnResult<PathBuf> {
        let want = resolved(&self.backing_file);
        let matches: Vec<PathBuf> = attached_devices(runner)?
            .into_iter()
            .filter(|entry| resolved(&entry.backing_file) == want)
            .filter_map(|entry| entry.device)
            .collect();
        match matches.as_slice() {
            [device] => Ok(device.clone()),
            [] => Err(KilnError::environment(format!(
                "could not find the loop device just set up for {}",
                self.backing_file.display()
            ))),
            _ => Err(KilnError::environment(format!(
                "multiple loop devices are backed by {}; cannot identify the one just set up",
                self.backing_file.display()
            ))),
        }
    }

    /// Detach the device node. Valid at most once per successful attach.
    ///
    /// # Errors
    ///
    /// [`KilnError::Validation`] when the device is not attached,
    /// [`KilnError::SystemCommand`] when `losetup -d` fails.
    pub fn detach(&mut self, runner: &dyn CommandRunner) -> KilnResult<()> {
        let Some(device) = &self.device else {
            return Err(KilnError::validation(
                "loop device is not attached, nothing to detach",
            ));
        };
        let argv = vec![
            "losetup".to_owned(),
            "-d".to_owned(),
            device.display().to_string(),
        ];
        runner.run_captured(&argv, Some(ADMIN_CMD_TIMEOUT))?;
        tracing::debug!(device = %device.display(), "loop device detached");
        self.device = None;
        Ok(())
    }
}

/// List the loop devices currently attached on the system.
///
/// # Errors
///
/// [`KilnError::SystemCommand`] when `losetup` fails or prints an
/// unexpected table.
pub fn attached_devices(runner: &dyn CommandRunner) -> KilnResult<Vec<LoopDevice>> {
    let argv: Vec<String> = ["losetup", "-O", "NAME,BACK-FILE,RO", "-n", "-l", "--raw"]
        .iter()
        .map(ToString::to_string)
        .collect();
    let output = runner.run_captured(&argv, Some(ADMIN_CMD_TIMEOUT))?;

    let mut devices = Vec::new();
    for line in output.lines().filter(|line| !line.trim().is_empty()) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [name, backing_file, ro] = fields.as_slice() else {
            return Err(SystemCommandError::new(
                cmdline::render(&argv),
                format!("unexpected output line: {line}"),
            )
            .into());
        };
        devices.push(LoopDevice {
            backing_file: PathBuf::from(unescape(backing_file)),
            device: Some(PathBuf::from(unescape(name))),
            read_only: *ro != "0",
        });
    }
    Ok(devices)
}

/// Undo whitespace escaping in `losetup --raw` output (`\xHH` hex and
/// `\NNN` octal escapes); anything else passes through verbatim.
fn unescape(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1] == b'x'
            && bytes[i + 2].is_ascii_hexdigit()
            && bytes[i + 3].is_ascii_hexdigit()
        {
            let hex = std::str::from_utf8(&bytes[i + 2..i + 4]).unwrap_or("20");
            out.push(u8::from_str_radix(hex, 16).unwrap_or(b' '));
            i += 4;
        } else if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let octal = std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or("040");
            out.push(u8::from_str_radix(octal, 8).unwrap_or(b' '));
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Absolutize a path against the current directory without touching the
/// filesystem.
fn absolute(path: PathBuf) -> PathBuf {
    std::path::absolute(&path).unwrap_or(path)
}

/// Resolve symlinks for backing-file comparison, falling back to the
/// lexical path when resolution fails.
fn resolved(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
