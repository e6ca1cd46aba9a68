//! # kiln-fs
//!
//! Mount stack primitives for kiln containers. Everything here drives the
//! host's command line utilities (`mount(8)`, `umount(8)`, `losetup(8)`,
//! `mksquashfs`) through a [`kiln_common::CommandRunner`], validating
//! before the first system call and releasing resources in strict reverse
//! acquisition order on every failure path.

#![warn(missing_docs)]

use std::time::Duration;

pub mod loopdev;
pub mod mount;
pub mod overlay;
pub mod squashfs;
pub mod tmpfs;

pub use loopdev::LoopDevice;
pub use mount::Mountpoint;
pub use overlay::OverlayfsMount;
pub use squashfs::SquashfsMount;
pub use tmpfs::TmpfsMount;

/// Timeout applied to short-lived administrative commands (mount, loop
/// setup and teardown). Long-running build commands are never timed.
pub const ADMIN_CMD_TIMEOUT: Duration = Duration::from_secs(5);
