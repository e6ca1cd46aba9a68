//! Runtime specification (config.json) types.
//!
//! Shaped after the OCI Runtime Specification:
//! <https://github.com/opencontainers/runtime-spec/blob/main/config.md>

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The specification version kiln emits.
pub const OCI_VERSION: &str = "1.0.0";

/// Runtime specification document for one container launch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    /// OCI specification version.
    pub oci_version: String,

    /// Process to run inside the container.
    pub process: Process,

    /// Container root filesystem.
    pub root: Root,

    /// Container hostname.
    pub hostname: String,

    /// Mounts performed by the launcher, in order.
    pub mounts: Vec<Mount>,

    /// Linux-specific configuration.
    pub linux: Linux,
}

/// Root filesystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Root {
    /// Path to the root filesystem, relative to the bundle directory.
    pub path: PathBuf,

    /// Whether the launcher should remount the rootfs read-only.
    #[serde(default)]
    pub readonly: bool,
}

/// Process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    /// Whether to hook the caller's terminal up to the process.
    #[serde(default)]
    pub terminal: bool,

    /// User to run as.
    pub user: User,

    /// Command arguments, `execve(2)` style.
    pub args: Vec<String>,

    /// Environment, as `KEY=value` entries.
    pub env: Vec<String>,

    /// Working directory inside the container.
    pub cwd: String,

    /// Capability sets granted to the process.
    pub capabilities: Capabilities,

    /// Resource limits.
    pub rlimits: Vec<Rlimit>,

    /// Forbid gaining new privileges (always set by kiln).
    #[serde(default)]
    pub no_new_privileges: bool,
}

/// User and group ids for the container process.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct User {
    /// User ID.
    pub uid: u32,
    /// Group ID.
    pub gid: u32,
}

/// Linux capability sets. All five sets carry the same capability names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capabilities {
    /// Bounding set.
    pub bounding: Vec<String>,
    /// Effective set.
    pub effective: Vec<String>,
    /// Inheritable set.
    pub inheritable: Vec<String>,
    /// Permitted set.
    pub permitted: Vec<String>,
    /// Ambient set.
    pub ambient: Vec<String>,
}

impl Capabilities {
    /// Grant the same capabilities in all five sets.
    #[must_use]
    pub fn all_sets(caps: Vec<String>) -> Self {
        Self {
            bounding: caps.clone(),
            effective: caps.clone(),
            inheritable: caps.clone(),
            permitted: caps.clone(),
            ambient: caps,
        }
    }
}

/// Resource limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rlimit {
    /// Limit name (e.g. `RLIMIT_NOFILE`).
    #[serde(rename = "type")]
    pub limit_type: String,
    /// Hard limit.
    pub hard: u64,
    /// Soft limit.
    pub soft: u64,
}

/// Mount performed by the launcher inside the container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    /// Mount source (a path, or a dummy name for pseudo-filesystems).
    pub source: String,
    /// Destination path inside the container.
    pub destination: String,
    /// Filesystem type, when not inferred.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub fs_type: Option<String>,
    /// Mount options.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// Linux-specific configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Linux {
    /// Device nodes created inside the container.
    pub devices: Vec<Device>,
    /// Resource controls.
    pub resources: Resources,
    /// Namespaces to unshare.
    pub namespaces: Vec<Namespace>,
    /// Paths masked from the container.
    pub masked_paths: Vec<String>,
    /// Paths remounted read-only inside the container.
    pub readonly_paths: Vec<String>,
}

/// Device node to create inside the container.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Device path inside the container.
    pub path: String,
    /// Device kind: `"c"` for character, `"b"` for block.
    #[serde(rename = "type")]
    pub device_type: String,
    /// Major number.
    pub major: i64,
    /// Minor number.
    pub minor: i64,
    /// File mode bits.
    pub file_mode: u32,
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
}

/// Resource controls (kiln only emits the device cgroup policy).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Resources {
    /// Device cgroup rules, evaluated in order.
    pub devices: Vec<DeviceCgroupRule>,
}

/// One device cgroup rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCgroupRule {
    /// Whether the rule allows or denies.
    pub allow: bool,
    /// Device kind the rule applies to (absent = all).
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    /// Major number (absent = all).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub major: Option<i64>,
    /// Minor number (absent = all).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minor: Option<i64>,
    /// Access string (`r`, `w`, `m` combinations).
    pub access: String,
}

impl DeviceCgroupRule {
    /// The deny-everything rule kiln always emits first.
    #[must_use]
    pub fn deny_all() -> Self {
        Self {
            allow: false,
            device_type: None,
            major: None,
            minor: None,
            access: "rwm".to_owned(),
        }
    }
}

/// Namespace entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    /// The namespace kind.
    #[serde(rename = "type")]
    pub ns_type: NamespaceType,
}

/// Namespace kinds, named as the runtime specification does (not as the
/// kernel does).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceType {
    /// PID namespace.
    Pid,
    /// IPC namespace.
    Ipc,
    /// UTS namespace.
    Uts,
    /// Mount namespace.
    Mount,
    /// Network namespace.
    Network,
}
