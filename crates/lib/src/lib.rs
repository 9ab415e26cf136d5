//! # Deployment engine for immutable operating system images
//!
//! This crate composes three subsystems:
//!
//! - the mount orchestrator ([`mount`]), which assembles the runtime view
//!   of a sysroot at boot (volumes, ephemeral overlays, persistent state)
//!   and emits an fstab describing it;
//! - the image and partition lifecycle ([`image`], [`partition`]), which
//!   creates, formats, populates and mounts filesystem images and
//!   partitions;
//! - the loop-device snapshotter ([`snapshotter`]), which manages numbered
//!   generations of root filesystem images with an active/passive symlink
//!   scheme and bounded retention.
//!
//! All host interaction flows through the capability objects collected in
//! [`Runtime`], so the whole engine can be driven hermetically in tests.

pub mod consts;
pub mod image;
pub mod mount;
pub mod mounter;
pub mod partition;
mod runtime;
pub use runtime::*;
pub mod snapshotter;
pub mod spec;
pub mod testing;
pub mod util;
