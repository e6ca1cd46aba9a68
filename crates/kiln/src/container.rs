//! Container description and runtime specification generation.
//!
//! A [`Container`] is an immutable-after-construction description of a
//! sandbox: rootfs image, capabilities, namespaces, mountpoints and device
//! bindings. It knows how to translate itself plus one command invocation
//! into the runtime specification document the external launcher consumes.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use kiln_common::error::{KilnError, KilnResult};
use kiln_fs::mount::is_normalized;
use kiln_oci::runtime::{
    Capabilities, Device, DeviceCgroupRule, Linux, Mount, Namespace, NamespaceType, OCI_VERSION,
    Process, Resources, Rlimit, Root, Spec, User,
};

/// Capabilities granted to containers by default. The list follows the
/// Docker default set, minus the `CAP_NET_*` entries: a container sharing
/// the host network namespace must not be able to reconfigure it.
pub const DEFAULT_CAPABILITIES: &[&str] = &[
    "CAP_AUDIT_WRITE",
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_KILL",
    "CAP_MKNOD",
    "CAP_SETFCAP",
    "CAP_SETGID",
    "CAP_SETPCAP",
    "CAP_SETUID",
    "CAP_SYS_CHROOT",
];

/// Paths masked from the container, protecting kernel introspection
/// surfaces.
const MASKED_PATHS: &[&str] = &[
    "/proc/kcore",
    "/proc/latency_stats",
    "/proc/timer_list",
    "/proc/timer_stats",
    "/proc/sched_debug",
    "/sys/firmware",
    "/proc/scsi",
];

/// Paths remounted read-only inside the container.
const READONLY_PATHS: &[&str] = &[
    "/proc/asound",
    "/proc/bus",
    "/proc/fs",
    "/proc/irq",
    "/proc/sys",
    "/proc/sysrq-trigger",
];

/// An ephemeral container description.
#[derive(Debug, Clone)]
pub struct Container {
    name: String,
    rootfs_image: PathBuf,
    hostname: String,
    readonly_root: bool,
    shared_host_netns: bool,
    capabilities: BTreeSet<String>,
    mounts: Vec<ContainerMount>,
    device_bindings: Vec<DeviceBinding>,
    default_env: BTreeMap<String, String>,
}

impl Container {
    /// Describe a container running on top of the squashfs image
    /// `rootfs_image`. The hostname defaults to the container name.
    ///
    /// # Errors
    ///
    /// [`KilnError::Validation`] when the name is empty or contains
    /// characters outside `[A-Za-z0-9._-]`.
    pub fn new(name: impl Into<String>, rootfs_image: impl Into<PathBuf>) -> KilnResult<Self> {
        let name = name.into();
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(KilnError::validation(format!(
                "container name {name:?} is invalid"
            )));
        }
        let default_env = BTreeMap::from([
            (
                "PATH".to_owned(),
                "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_owned(),
            ),
            ("TERM".to_owned(), "xterm".to_owned()),
        ]);
        Ok(Self {
            hostname: name.clone(),
            name,
            rootfs_image: rootfs_image.into(),
            readonly_root: false,
            shared_host_netns: false,
            capabilities: DEFAULT_CAPABILITIES
                .iter()
                .map(ToString::to_string)
                .collect(),
            mounts: Vec::new(),
            device_bindings: Vec::new(),
            default_env,
        })
    }

    /// Override the hostname inside the container.
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Mount the rootfs image directly, without a writable overlay.
    #[must_use]
    pub const fn with_readonly_root(mut self, readonly: bool) -> Self {
        self.readonly_root = readonly;
        self
    }

    /// Share the host network namespace instead of unsharing a fresh one.
    /// Spares the host from routing and filtering setup when the container
    /// needs network access.
    #[must_use]
    pub const fn with_shared_host_netns(mut self, shared: bool) -> Self {
        self.shared_host_netns = shared;
        self
    }

    /// Grant an additional capability.
    #[must_use]
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        let _ = self.capabilities.insert(capability.into());
        self
    }

    /// Add a caller-supplied mountpoint, serialized after the required
    /// system mountpoints.
    #[must_use]
    pub fn with_mount(mut self, mount: ContainerMount) -> Self {
        self.mounts.push(mount);
        self
    }

    /// Bind a host device node into the container.
    #[must_use]
    pub fn with_device_binding(mut self, binding: DeviceBinding) -> Self {
        self.device_bindings.push(binding);
        self
    }

    /// The container name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The squashfs rootfs image.
    #[must_use]
    pub fn rootfs_image(&self) -> &Path {
        &self.rootfs_image
    }

    /// The hostname inside the container.
    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Whether the rootfs is mounted read-only, without an overlay.
    #[must_use]
    pub const fn is_readonly_root(&self) -> bool {
        self.readonly_root
    }

    /// Whether the container shares the host network namespace.
    #[must_use]
    pub const fn shares_host_netns(&self) -> bool {
        self.shared_host_netns
    }

    /// The granted capability set.
    #[must_use]
    pub const fn capabilities(&self) -> &BTreeSet<String> {
        &self.capabilities
    }

    /// The caller-supplied mountpoints.
    #[must_use]
    pub fn mounts(&self) -> &[ContainerMount] {
        &self.mounts
    }

    /// The configured device bindings.
    #[must_use]
    pub fn device_bindings(&self) -> &[DeviceBinding] {
        &self.device_bindings
    }

    /// The environment injected beneath caller-supplied variables.
    #[must_use]
    pub const fn default_env(&self) -> &BTreeMap<String, String> {
        &self.default_env
    }

    /// The namespaces to unshare, following the runtime specification
    /// nomenclature. The network namespace stays shared with the host when
    /// [`Container::with_shared_host_netns`] was set.
    #[must_use]
    pub fn unshared_namespaces(&self) -> Vec<NamespaceType> {
        let mut namespaces = vec![
            NamespaceType::Pid,
            NamespaceType::Ipc,
            NamespaceType::Uts,
            NamespaceType::Mount,
        ];
        if !self.shared_host_netns {
            namespaces.push(NamespaceType::Network);
        }
        namespaces
    }

    /// The required default system mountpoints (`/proc`, `/dev`, ...) for
    /// the container to run properly, as `runc spec` would emit them.
    fn required_mounts() -> Vec<ContainerMount> {
        vec![
            ContainerMount::new_unchecked("proc", "/proc", Some("proc"), &[]),
            ContainerMount::new_unchecked(
                "tmpfs",
                "/dev",
                Some("tmpfs"),
                &["nosuid", "strictatime", "mode=755", "size=65536k"],
            ),
            ContainerMount::new_unchecked(
                "devpts",
                "/dev/pts",
                Some("devpts"),
                &[
                    "nosuid",
                    "noexec",
                    "newinstance",
                    "ptmxmode=0666",
                    "mode=0620",
                    "gid=5",
                ],
            ),
            ContainerMount::new_unchecked(
                "shm",
                "/dev/shm",
                Some("tmpfs"),
                &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"],
            ),
            ContainerMount::new_unchecked(
                "mqueue",
                "/dev/mqueue",
                Some("mqueue"),
                &["nosuid", "noexec", "nodev"],
            ),
            ContainerMount::new_unchecked(
                "sysfs",
                "/sys",
                Some("sysfs"),
                &["nosuid", "noexec", "nodev", "ro"],
            ),
            ContainerMount::new_unchecked(
                "cgroup",
                "/sys/fs/cgroup",
                Some("cgroup"),
                &["nosuid", "noexec", "nodev", "relatime", "ro"],
            ),
        ]
    }

    /// Generate the runtime specification document for one command
    /// invocation. Written to the bundle directory before each launch.
    #[must_use]
    pub fn runtime_spec(&self, command: &[String], options: &RunOptions) -> Spec {
        let capabilities: Vec<String> = self.capabilities.iter().cloned().collect();

        let mut env = self.default_env.clone();
        env.extend(options.env.clone());

        let mut mounts: Vec<Mount> = Self::required_mounts()
            .iter()
            .map(ContainerMount::to_oci)
            .collect();
        mounts.extend(self.mounts.iter().map(ContainerMount::to_oci));

        let mut device_rules = vec![DeviceCgroupRule::deny_all()];
        device_rules.extend(self.device_bindings.iter().map(DeviceBinding::cgroup_rule));

        Spec {
            oci_version: OCI_VERSION.to_owned(),
            process: Process {
                terminal: options.terminal,
                user: User {
                    uid: options.user.0,
                    gid: options.user.1,
                },
                args: command.to_vec(),
                env: env
                    .iter()
                    .map(|(key, value)| format!("{key}={value}"))
                    .collect(),
                cwd: options.cwd.clone(),
                capabilities: Capabilities::all_sets(capabilities),
                rlimits: vec![Rlimit {
                    limit_type: "RLIMIT_NOFILE".to_owned(),
                    hard: 4096,
                    soft: 4096,
                }],
                no_new_privileges: true,
            },
            root: Root {
                // The launcher resolves this relative to the bundle; the
                // read-only property is enforced by the mount stack, not
                // here.
                path: "rootfs".into(),
                readonly: false,
            },
            hostname: self.hostname.clone(),
            mounts,
            linux: Linux {
                devices: self
                    .device_bindings
                    .iter()
                    .map(DeviceBinding::to_oci)
                    .collect(),
                resources: Resources {
                    devices: device_rules,
                },
                namespaces: self
                    .unshared_namespaces()
                    .into_iter()
                    .map(|ns_type| Namespace { ns_type })
                    .collect(),
                masked_paths: MASKED_PATHS.iter().map(ToString::to_string).collect(),
                readonly_paths: READONLY_PATHS.iter().map(ToString::to_string).collect(),
            },
        }
    }
}

/// Per-invocation settings for a command run inside a container.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Working directory inside the container.
    pub cwd: String,
    /// Environment variables, merged over the container's default set.
    pub env: BTreeMap<String, String>,
    /// Hook the caller's terminal up to the container process.
    pub terminal: bool,
    /// `(uid, gid)` the process runs as inside the container.
    pub user: (u32, u32),
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            cwd: "/".to_owned(),
            env: BTreeMap::new(),
            terminal: false,
            user: (0, 0),
        }
    }
}

/// A mountpoint serialized into the runtime specification (performed by
/// the launcher inside the container, not by kiln itself).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerMount {
    source: String,
    destination: String,
    fs_type: Option<String>,
    options: Vec<String>,
}

impl ContainerMount {
    /// Validate and build a container mountpoint.
    ///
    /// # Errors
    ///
    /// [`KilnError::Validation`] when the destination is not an absolute
    /// normalized path or an option contains a comma.
    pub fn new<S>(
        source: impl Into<String>,
        destination: impl Into<String>,
        fs_type: Option<&str>,
        options: impl IntoIterator<Item = S>,
    ) -> KilnResult<Self>
    where
        S: Into<String>,
    {
        let destination = destination.into();
        if !is_normalized(Path::new(&destination)) {
            return Err(KilnError::validation(format!(
                "mount destination {destination:?} must be an absolute and normalized path"
            )));
        }
        let options: Vec<String> = options.into_iter().map(Into::into).collect();
        if options.iter().any(|option| option.contains(',')) {
            return Err(KilnError::validation(
                "a mount option contains a comma, which serves as the option \
                 separator of the underlying mount command",
            ));
        }
        Ok(Self {
            source: source.into(),
            destination,
            fs_type: fs_type.map(ToOwned::to_owned),
            options,
        })
    }

    /// Build without validation; reserved for the fixed system mount
    /// list, which is known to be valid.
    fn new_unchecked(
        source: &str,
        destination: &str,
        fs_type: Option<&str>,
        options: &[&str],
    ) -> Self {
        Self {
            source: source.to_owned(),
            destination: destination.to_owned(),
            fs_type: fs_type.map(ToOwned::to_owned),
            options: options.iter().map(ToString::to_string).collect(),
        }
    }

    /// The mount source.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The destination inside the container.
    #[must_use]
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Serialize into the runtime specification shape.
    #[must_use]
    pub fn to_oci(&self) -> Mount {
        Mount {
            source: self.source.clone(),
            destination: self.destination.clone(),
            fs_type: self.fs_type.clone(),
            options: self.options.clone(),
        }
    }
}

/// Kind of a bound device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Character device.
    Char,
    /// Block device.
    Block,
}

impl DeviceKind {
    /// The single-letter form used by the runtime specification.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Char => "c",
            Self::Block => "b",
        }
    }
}

/// A host device node bound into a container.
///
/// The binding captures the device's status (numbers, mode, ownership,
/// kind) at construction time; it is a point-in-time snapshot, not a live
/// reference. The launcher provides the default nodes (`/dev/null`,
/// `/dev/zero`, ...) by itself, so only extra devices need bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceBinding {
    host_device: PathBuf,
    container_device: PathBuf,
    kind: DeviceKind,
    major: i64,
    minor: i64,
    file_mode: u32,
    uid: u32,
    gid: u32,
}

impl DeviceBinding {
    /// Snapshot `host_device` for binding at `container_device` (same path
    /// as on the host when omitted).
    ///
    /// # Errors
    ///
    /// [`KilnError::Validation`] when either path is not absolute and
    /// normalized, or when `host_device` is not an existing character or
    /// block special file.
    #[allow(clippy::cast_possible_truncation, clippy::unnecessary_cast)]
    pub fn from_host(
        host_device: impl Into<PathBuf>,
        container_device: Option<PathBuf>,
    ) -> KilnResult<Self> {
        let host_device = host_device.into();
        if !is_normalized(&host_device) {
            return Err(KilnError::validation(format!(
                "host device {} must be an absolute and normalized path",
                host_device.display()
            )));
        }
        if let Some(container_device) = &container_device {
            if !is_normalized(container_device) {
                return Err(KilnError::validation(format!(
                    "container device {} must be an absolute and normalized path",
                    container_device.display()
                )));
            }
        }

        tracing::debug!(
            device = %host_device.display(),
            "identifying device properties for container binding"
        );
        // lstat: a symlink to a device is not itself a device node.
        let stat = rustix::fs::lstat(&host_device).map_err(|err| {
            KilnError::validation(format!(
                "cannot stat host device {}: {err}",
                host_device.display()
            ))
        })?;
        let file_type = rustix::fs::FileType::from_raw_mode(stat.st_mode as rustix::fs::RawMode);
        let kind = match file_type {
            rustix::fs::FileType::CharacterDevice => DeviceKind::Char,
            rustix::fs::FileType::BlockDevice => DeviceKind::Block,
            _ => {
                return Err(KilnError::validation(format!(
                    "host device {} must be a character or block special file",
                    host_device.display()
                )));
            }
        };

        Ok(Self {
            container_device: container_device.unwrap_or_else(|| host_device.clone()),
            host_device,
            kind,
            major: i64::from(rustix::fs::major(stat.st_rdev as u64)),
            minor: i64::from(rustix::fs::minor(stat.st_rdev as u64)),
            file_mode: (stat.st_mode as u32) & 0o7777,
            uid: stat.st_uid,
            gid: stat.st_gid,
        })
    }

    /// The device path on the host.
    #[must_use]
    pub fn host_device(&self) -> &Path {
        &self.host_device
    }

    /// The device path inside the container.
    #[must_use]
    pub fn container_device(&self) -> &Path {
        &self.container_device
    }

    /// The device kind.
    #[must_use]
    pub const fn kind(&self) -> DeviceKind {
        self.kind
    }

    /// Serialize into the runtime specification device shape.
    #[must_use]
    pub fn to_oci(&self) -> Device {
        Device {
            path: self.container_device.display().to_string(),
            device_type: self.kind.as_str().to_owned(),
            major: self.major,
            minor: self.minor,
            file_mode: self.file_mode,
            uid: self.uid,
            gid: self.gid,
        }
    }

    /// The device cgroup rule allowing access to this device.
    #[must_use]
    pub fn cgroup_rule(&self) -> DeviceCgroupRule {
        DeviceCgroupRule {
            allow: true,
            device_type: Some(self.kind.as_str().to_owned()),
            major: Some(self.major),
            minor: Some(self.minor),
            access: "rwm".to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_names_are_validated() {
        assert!(Container::new("test.1", "/images/sdk.squashfs").is_ok());
        assert!(Container::new("sdk-core_5.1", "/images/sdk.squashfs").is_ok());
        assert!(Container::new("", "/images/sdk.squashfs").is_err());
        assert!(Container::new("bad name", "/images/sdk.squashfs").is_err());
        assert!(Container::new("bad/name", "/images/sdk.squashfs").is_err());
    }

    #[test]
    fn hostname_defaults_to_name() {
        let container = Container::new("builder.1", "/images/sdk.squashfs").unwrap();
        assert_eq!(container.hostname(), "builder.1");
        let renamed = container.with_hostname("forge");
        assert_eq!(renamed.hostname(), "forge");
    }

    #[test]
    fn network_namespace_follows_sharing_flag() {
        let isolated = Container::new("a", "/img").unwrap();
        assert!(
            isolated
                .unshared_namespaces()
                .contains(&NamespaceType::Network)
        );

        let shared = Container::new("a", "/img")
            .unwrap()
            .with_shared_host_netns(true);
        assert!(
            !shared
                .unshared_namespaces()
                .contains(&NamespaceType::Network)
        );
        // The other namespaces are always unshared.
        for ns in [
            NamespaceType::Pid,
            NamespaceType::Ipc,
            NamespaceType::Uts,
            NamespaceType::Mount,
        ] {
            assert!(shared.unshared_namespaces().contains(&ns));
        }
    }

    #[test]
    fn default_capabilities_exclude_network() {
        let container = Container::new("a", "/img").unwrap();
        assert!(container.capabilities().contains("CAP_CHOWN"));
        assert!(container.capabilities().contains("CAP_SYS_CHROOT"));
        assert!(!container.capabilities().iter().any(|c| c.contains("NET")));
    }

    #[test]
    fn container_mount_validation() {
        assert!(ContainerMount::new("tmpfs", "/tmp", Some("tmpfs"), ["nodev", "nosuid"]).is_ok());
        assert!(ContainerMount::new("tmpfs", "tmp", Some("tmpfs"), ["nodev"]).is_err());
        assert!(ContainerMount::new("tmpfs", "/tmp/../x", Some("tmpfs"), ["nodev"]).is_err());
        assert!(ContainerMount::new("tmpfs", "/tmp", Some("tmpfs"), ["a,b"]).is_err());
    }

    #[test]
    fn runtime_spec_shape() {
        let container = Container::new("test.1", "/images/sdk.squashfs")
            .unwrap()
            .with_mount(ContainerMount::new("/srv/out", "/mnt/out", None, ["bind", "rw"]).unwrap());
        let mut options = RunOptions::default();
        let _ = options
            .env
            .insert("CURRENT_ACTION".to_owned(), "build".to_owned());
        let spec = container.runtime_spec(&["sh".to_owned(), "-c".to_owned(), "true".to_owned()], &options);

        assert_eq!(spec.oci_version, "1.0.0");
        assert_eq!(spec.hostname, "test.1");
        assert!(spec.process.no_new_privileges);
        assert_eq!(spec.process.cwd, "/");
        assert_eq!(spec.root.path, Path::new("rootfs"));
        assert_eq!(spec.process.rlimits[0].limit_type, "RLIMIT_NOFILE");

        // Required system mounts come first, caller mounts after.
        assert_eq!(spec.mounts[0].destination, "/proc");
        assert_eq!(spec.mounts.last().unwrap().destination, "/mnt/out");
        assert_eq!(spec.mounts.len(), 8);

        // The default env sits beneath the caller's variables.
        assert!(spec.process.env.contains(&"TERM=xterm".to_owned()));
        assert!(spec.process.env.contains(&"CURRENT_ACTION=build".to_owned()));

        // Device cgroup policy denies everything by default.
        assert_eq!(spec.linux.resources.devices.len(), 1);
        assert!(!spec.linux.resources.devices[0].allow);

        assert_eq!(spec.linux.masked_paths.len(), 7);
        assert_eq!(spec.linux.readonly_paths.len(), 6);
    }

    #[test]
    fn caller_env_overrides_defaults() {
        let container = Container::new("a", "/img").unwrap();
        let mut options = RunOptions::default();
        let _ = options
            .env
            .insert("TERM".to_owned(), "dumb".to_owned());
        let spec = container.runtime_spec(&["true".to_owned()], &options);
        assert!(spec.process.env.contains(&"TERM=dumb".to_owned()));
        assert!(!spec.process.env.contains(&"TERM=xterm".to_owned()));
    }

    #[test]
    fn device_binding_from_char_device() {
        // /dev/null is a character device everywhere the tests run.
        let binding = DeviceBinding::from_host("/dev/null", None).unwrap();
        assert_eq!(binding.kind(), DeviceKind::Char);
        assert_eq!(binding.container_device(), Path::new("/dev/null"));
        let device = binding.to_oci();
        assert_eq!(device.device_type, "c");
        assert_eq!(device.major, 1);
        assert_eq!(device.minor, 3);

        let rule = binding.cgroup_rule();
        assert!(rule.allow);
        assert_eq!(rule.access, "rwm");
        assert_eq!(rule.major, Some(1));
        assert_eq!(rule.minor, Some(3));
    }

    #[test]
    fn device_binding_rejects_regular_files() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = DeviceBinding::from_host(file.path().to_path_buf(), None).unwrap_err();
        assert!(matches!(err, KilnError::Validation { .. }));
    }

    #[test]
    fn device_binding_rejects_relative_paths() {
        assert!(DeviceBinding::from_host("dev/null", None).is_err());
        assert!(
            DeviceBinding::from_host("/dev/null", Some(PathBuf::from("dev/null"))).is_err()
        );
    }

    #[test]
    fn device_binding_spec_includes_allow_rule() {
        let container = Container::new("a", "/img")
            .unwrap()
            .with_device_binding(DeviceBinding::from_host("/dev/null", None).unwrap());
        let spec = container.runtime_spec(&["true".to_owned()], &RunOptions::default());
        assert_eq!(spec.linux.devices.len(), 1);
        assert_eq!(spec.linux.resources.devices.len(), 2);
        assert!(!spec.linux.resources.devices[0].allow);
        assert!(spec.linux.resources.devices[1].allow);
    }
}
