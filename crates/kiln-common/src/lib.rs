//! # kiln-common
//!
//! Shared foundation for the kiln build-container toolkit:
//! - Error taxonomy used across all kiln crates
//! - External command execution (with captured or attached output)
//! - Privilege lowering and scoped elevation
//! - Deferred-release stack for nested kernel resources
//! - Kernel version probing, command-line splitting, standard paths

#![warn(missing_docs)]

pub mod cmdline;
pub mod error;
pub mod exec;
pub mod paths;
pub mod privileges;
pub mod release;
pub mod version;

pub use error::{KilnError, KilnResult, SystemCommandError};
pub use exec::{CommandRunner, SystemRunner};
pub use paths::KilnPaths;
pub use privileges::{ElevatedGuard, PrivilegeContext};
pub use release::ReleaseStack;
