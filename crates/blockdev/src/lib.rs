//! Block device plumbing: device discovery via lsblk/blkid, partition
//! tables via parted, filesystem creation via the mkfs family, and loop
//! device attachment. All host interaction goes through an injected
//! [`elemental_utils::Runner`].

mod lsblk;
pub use lsblk::*;
pub mod loopback;
mod parted;
pub use parted::*;
