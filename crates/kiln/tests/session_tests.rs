//! Integration tests for the container session lifecycle.
//!
//! Kernel resources are driven through command line utilities, so the
//! whole lifecycle can be exercised against a scripted runner: the tests
//! assert the exact commands issued and their ordering. One final test
//! runs the real thing; it self-skips unless it has root, a launcher and
//! squashfs-tools.

use std::path::Path;
use std::sync::Arc;

use kiln::{Container, ContainerSession, RunOptions};
use kiln_common::error::KilnError;
use kiln_common::exec::testing::ScriptedRunner;

const IMAGE: &str = "/images/base.squashfs";

fn script_attach(runner: &ScriptedRunner, device: &str) {
    runner.enqueue_output("losetup", "");
    runner.enqueue_output("losetup", &format!("{device} {IMAGE} 1\n"));
}

fn readonly_container() -> Container {
    Container::new("test.1", IMAGE)
        .unwrap()
        .with_readonly_root(true)
}

fn writable_container() -> Container {
    Container::new("test.1", IMAGE).unwrap()
}

#[test]
fn readonly_session_mounts_the_image_directly() {
    let runner = Arc::new(ScriptedRunner::new());
    script_attach(&runner, "/dev/loop0");
    let runtime = tempfile::tempdir().unwrap();

    let mut session =
        ContainerSession::open(readonly_container(), runtime.path(), runner.clone()).unwrap();
    let rootfs = session.rootfs_dir().display().to_string();

    let lines = runner.command_lines();
    assert_eq!(lines[0], format!("losetup -r -f {IMAGE}"));
    assert_eq!(lines[1], "losetup -O NAME,BACK-FILE,RO -n -l --raw");
    assert_eq!(lines[2], format!("mount -t squashfs -o ro /dev/loop0 {rootfs}"));
    assert_eq!(lines.len(), 3);

    session.close().unwrap();
    let lines = runner.command_lines();
    assert_eq!(lines[3], format!("umount {rootfs}"));
    assert_eq!(lines[4], "losetup -d /dev/loop0");
}

#[test]
fn writable_session_assembles_the_overlay_stack() {
    let runner = Arc::new(ScriptedRunner::new());
    script_attach(&runner, "/dev/loop3");
    let runtime = tempfile::tempdir().unwrap();

    let mut session =
        ContainerSession::open(writable_container(), runtime.path(), runner.clone()).unwrap();
    let bundle = session.bundle_dir().display().to_string();
    let rootfs = session.rootfs_dir().display().to_string();

    // The assembled rootfs directory exists and starts out empty.
    assert!(session.rootfs_dir().is_dir());
    assert_eq!(
        std::fs::read_dir(session.rootfs_dir()).unwrap().count(),
        0
    );
    // Upper and work directories live inside the scratch tmpfs.
    assert!(Path::new(&bundle).join("overlay/tmpfs/upper").is_dir());
    assert!(Path::new(&bundle).join("overlay/tmpfs/work").is_dir());

    let lines = runner.command_lines();
    assert_eq!(lines[2], format!("mount -t squashfs -o ro /dev/loop3 {bundle}/overlay/lower"));
    assert_eq!(
        lines[3],
        format!("mount -t tmpfs -o size=10g tmpfs {bundle}/overlay/tmpfs")
    );
    assert!(lines[4].starts_with("mount -t overlay -o "));
    assert!(lines[4].contains(&format!("lowerdir={bundle}/overlay/lower")));
    assert!(lines[4].contains(&format!("upperdir={bundle}/overlay/tmpfs/upper")));
    assert!(lines[4].contains(&format!("workdir={bundle}/overlay/tmpfs/work")));
    assert!(lines[4].ends_with(&format!("overlay {rootfs}")));

    session.close().unwrap();

    // Teardown runs in exact reverse order of assembly.
    let lines = runner.command_lines();
    assert_eq!(lines[5], format!("umount {rootfs}"));
    assert_eq!(lines[6], format!("umount {bundle}/overlay/tmpfs"));
    assert_eq!(lines[7], format!("umount {bundle}/overlay/lower"));
    assert_eq!(lines[8], "losetup -d /dev/loop3");
}

#[test]
fn loop_devices_do_not_leak_across_a_session() {
    let runner = Arc::new(ScriptedRunner::new());
    script_attach(&runner, "/dev/loop3");
    let runtime = tempfile::tempdir().unwrap();

    let mut session =
        ContainerSession::open(writable_container(), runtime.path(), runner.clone()).unwrap();
    session.close().unwrap();

    let attaches = runner
        .command_lines()
        .iter()
        .filter(|line| line.starts_with("losetup -r") || line.starts_with("losetup -f"))
        .count();
    let detaches = runner
        .command_lines()
        .iter()
        .filter(|line| line.starts_with("losetup -d"))
        .count();
    assert_eq!(attaches, detaches);
}

#[test]
fn assembly_failure_releases_what_was_acquired() {
    let runner = Arc::new(ScriptedRunner::new());
    script_attach(&runner, "/dev/loop3");
    // The squashfs lower mount succeeds, the tmpfs mount fails.
    runner.enqueue_output("mount", "");
    runner.enqueue_failure("mount", "returned exit status 32");
    let runtime = tempfile::tempdir().unwrap();

    let err =
        ContainerSession::open(writable_container(), runtime.path(), runner.clone()).unwrap_err();
    assert!(matches!(err, KilnError::SystemCommand(_)));

    // The already-mounted lower layer was unmounted and its loop device
    // detached, in that order.
    let lines = runner.command_lines();
    let umount_at = lines
        .iter()
        .position(|line| line.starts_with("umount"))
        .expect("lower layer unmounted");
    let detach_at = lines
        .iter()
        .position(|line| line.starts_with("losetup -d"))
        .expect("loop device detached");
    assert!(umount_at < detach_at);
}

#[test]
fn run_writes_the_runtime_spec_and_invokes_the_launcher() {
    let runner = Arc::new(ScriptedRunner::new());
    script_attach(&runner, "/dev/loop3");
    let runtime = tempfile::tempdir().unwrap();

    let mut session =
        ContainerSession::open(writable_container(), runtime.path(), runner.clone()).unwrap();
    session.set_launcher("/opt/runc");
    session
        .run(
            &["touch".to_owned(), "/marker".to_owned()],
            &RunOptions::default(),
        )
        .unwrap();

    let bundle = session.bundle_dir().display().to_string();
    let last = runner.command_lines().pop().unwrap();
    assert_eq!(
        last,
        format!("/opt/runc run --bundle {bundle} {}", session.instance())
    );
    // The instance name is derived from the bundle directory name.
    assert!(session.instance().starts_with("test.1."));

    let config: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(session.bundle_dir().join("config.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(config["ociVersion"], "1.0.0");
    assert_eq!(config["hostname"], "test.1");
    assert_eq!(config["process"]["args"][0], "touch");
    assert_eq!(config["process"]["args"][1], "/marker");
    assert_eq!(config["process"]["noNewPrivileges"], true);
    assert_eq!(config["root"]["path"], "rootfs");
    // Required system mounts lead the mount list.
    assert_eq!(config["mounts"][0]["destination"], "/proc");
    // Isolated container: the network namespace is unshared too.
    let namespaces: Vec<&str> = config["linux"]["namespaces"]
        .as_array()
        .unwrap()
        .iter()
        .map(|ns| ns["type"].as_str().unwrap())
        .collect();
    assert_eq!(namespaces, ["pid", "ipc", "uts", "mount", "network"]);
    // Deny-all device cgroup policy.
    assert_eq!(config["linux"]["resources"]["devices"][0]["allow"], false);

    session.close().unwrap();
}

#[test]
fn a_failed_run_leaves_the_session_usable() {
    let runner = Arc::new(ScriptedRunner::new());
    script_attach(&runner, "/dev/loop3");
    runner.enqueue_failure("/opt/runc", "returned exit status 2");
    let runtime = tempfile::tempdir().unwrap();

    let mut session =
        ContainerSession::open(writable_container(), runtime.path(), runner.clone()).unwrap();
    session.set_launcher("/opt/runc");

    let first = session.run(&["false".to_owned()], &RunOptions::default());
    assert!(matches!(first, Err(KilnError::SystemCommand(_))));

    // The session did not tear down; another command goes through.
    session
        .run(&["true".to_owned()], &RunOptions::default())
        .unwrap();
    session.close().unwrap();
}

#[test]
fn snapshot_compresses_the_rootfs() {
    let runner = Arc::new(ScriptedRunner::new());
    script_attach(&runner, "/dev/loop3");
    let runtime = tempfile::tempdir().unwrap();
    let output = runtime.path().join("out.squashfs");

    let mut session =
        ContainerSession::open(writable_container(), runtime.path(), runner.clone()).unwrap();
    session.snapshot(&output).unwrap();

    let rootfs = session.rootfs_dir().display().to_string();
    let line = runner
        .command_lines()
        .into_iter()
        .find(|line| line.starts_with("mksquashfs"))
        .expect("mksquashfs invoked");
    assert!(line.starts_with(&format!("mksquashfs {rootfs} {}", output.display())));
    assert!(line.contains("-comp gzip"));
    assert!(line.contains("-xattrs"));

    session.close().unwrap();
}

#[test]
fn snapshot_on_a_readonly_session_is_rejected_without_side_effect() {
    let runner = Arc::new(ScriptedRunner::new());
    script_attach(&runner, "/dev/loop0");
    let runtime = tempfile::tempdir().unwrap();
    let output = runtime.path().join("out.squashfs");

    let mut session =
        ContainerSession::open(readonly_container(), runtime.path(), runner.clone()).unwrap();
    let err = session.snapshot(&output).unwrap_err();
    assert!(matches!(err, KilnError::Snapshot { .. }));
    assert!(!output.exists());
    assert!(
        !runner
            .command_lines()
            .iter()
            .any(|line| line.starts_with("mksquashfs"))
    );
    session.close().unwrap();
}

#[test]
fn running_after_close_is_a_session_state_error() {
    let runner = Arc::new(ScriptedRunner::new());
    script_attach(&runner, "/dev/loop0");
    let runtime = tempfile::tempdir().unwrap();

    let mut session =
        ContainerSession::open(readonly_container(), runtime.path(), runner.clone()).unwrap();
    session.close().unwrap();

    let err = session
        .run(&["true".to_owned()], &RunOptions::default())
        .unwrap_err();
    assert!(matches!(err, KilnError::SessionState { .. }));

    // Snapshots are no longer valid either.
    let err = session.snapshot(Path::new("/tmp/never.squashfs")).unwrap_err();
    assert!(matches!(err, KilnError::SessionState { .. }));

    // A second close stays a no-op.
    session.close().unwrap();
}

#[test]
fn dropping_an_open_session_tears_the_stack_down() {
    let runner = Arc::new(ScriptedRunner::new());
    script_attach(&runner, "/dev/loop3");
    let runtime = tempfile::tempdir().unwrap();

    {
        let _session =
            ContainerSession::open(writable_container(), runtime.path(), runner.clone()).unwrap();
    }
    assert!(
        runner
            .command_lines()
            .iter()
            .any(|line| line.starts_with("losetup -d"))
    );
}

/// The end-to-end scenario against real kernel resources: build a
/// writable session from an empty image, leave a marker in the overlay,
/// snapshot it and check the produced image contains the marker.
///
/// Self-skips unless running as root with a launcher, squashfs-tools and
/// loop devices available.
#[test]
fn end_to_end_snapshot_round_trip() {
    use kiln_common::exec::{CommandRunner, SystemRunner};

    if !rustix::process::geteuid().is_root()
        || which::which("runc").is_err()
        || which::which("mksquashfs").is_err()
        || which::which("losetup").is_err()
    {
        eprintln!("skipping: needs root, runc, squashfs-tools and losetup");
        return;
    }

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new());
    let scratch = tempfile::tempdir().unwrap();

    // An empty source tree makes an empty (but valid) squashfs image.
    let empty = scratch.path().join("empty");
    std::fs::create_dir(&empty).unwrap();
    let image = scratch.path().join("base.squashfs");
    kiln_fs::squashfs::mksquashfs(
        &image,
        &empty,
        &kiln_fs::squashfs::MksquashfsOptions::default(),
        &*runner,
    )
    .unwrap();

    let container = Container::new("test.1", &image).unwrap();
    let runtime = scratch.path().join("run");
    let mut session = ContainerSession::open(container, &runtime, runner.clone()).unwrap();

    // The assembled rootfs is writable and empty.
    assert_eq!(std::fs::read_dir(session.rootfs_dir()).unwrap().count(), 0);
    // An empty rootfs has no shell to run `touch`, so the marker goes in
    // through the overlay from the host side; the write proves the merged
    // mount is writable.
    std::fs::write(session.rootfs_dir().join("marker"), b"").unwrap();

    let output = scratch.path().join("out.squashfs");
    session.snapshot(&output).unwrap();
    session.close().unwrap();
    assert!(output.is_file());

    // Mount the produced image and check the marker survived.
    let check = scratch.path().join("check");
    std::fs::create_dir(&check).unwrap();
    let mut squash = kiln_fs::SquashfsMount::new(&output, &check);
    squash.mount(&*runner).unwrap();
    let marker_present = check.join("marker").exists();
    squash.unmount(&*runner).unwrap();
    assert!(marker_present);
}
