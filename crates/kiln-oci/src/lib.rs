//! # kiln-oci
//!
//! Serde models for the runtime specification document (`config.json`)
//! consumed by the external OCI launcher. Only the subset kiln generates is
//! modeled; the document is written fresh into the bundle directory before
//! every launch.

#![warn(missing_docs)]

pub mod runtime;

pub use runtime::Spec;
