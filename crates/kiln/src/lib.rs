//! # kiln
//!
//! Ephemeral, sandboxed build containers assembled from compressed
//! read-only root filesystem images.
//!
//! A [`Container`] describes the sandbox (image, capabilities, namespaces,
//! mounts, device bindings). Opening a [`ContainerSession`] assembles its
//! root filesystem from the image (directly for read-only containers,
//! through a tmpfs-backed overlay for writable ones), generates a runtime
//! specification per command and drives an external OCI launcher against
//! the bundle. A writable session can be snapshotted back into a reusable
//! squashfs image. [`Sdk`] orchestrates prelude/body/postlude command
//! pipelines over one session, with the environment contract of the
//! recipe/product layer modeled by [`BuildContext`].
//!
//! Resource acquisition is strictly nested; releases always run in reverse
//! order, on every failure path.

#![warn(missing_docs)]

pub mod container;
pub mod env;
pub mod launcher;
pub mod sdk;
pub mod session;

pub use container::{Container, ContainerMount, DeviceBinding, RunOptions};
pub use env::{BuildContext, InstrumentationLevel};
pub use launcher::find_launcher;
pub use sdk::{BootstrapRequest, Sdk, SdkSession};
pub use session::ContainerSession;
