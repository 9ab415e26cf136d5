//! Layout constants shared across the engine.

/// Default root for the engine's runtime state.
pub const RUN_ELEMENTAL_DIR: &str = "/run/elemental";
/// Name of the ephemeral overlay workspace under the runtime root.
pub const OVERLAY_DIRNAME: &str = "overlay";
/// Name of the staging tree mountpoint under the runtime root.
pub const STAGING_DIRNAME: &str = "staging";
/// Name of the image-source mountpoint under the runtime root.
pub const IMGSRC_DIRNAME: &str = "imgsrc";
/// Mountpoint of the state partition while the initramfs runs.
pub const RUNNING_STATE_DIR: &str = "/run/initramfs/elemental-state";
/// State directory kept on the persistent volume.
pub const PERSISTENT_STATE_DIR: &str = ".state";

/// Suffix of per-path overlay workspaces.
pub const OVERLAY_SUFFIX: &str = ".overlay";
/// Suffix of per-path bind state directories.
pub const BIND_SUFFIX: &str = ".bind";
/// Filesystem type used to mount block-backed ephemeral workspaces.
/// Kept as the literal "autofs" for compatibility with deployed initramfs
/// configurations.
pub const EPHEMERAL_BLOCK_FSTYPE: &str = "autofs";

/// Snapshot tree, relative to the state partition root.
pub const SNAPSHOTS_DIR: &str = ".snapshots";
/// Backing image file inside each snapshot directory.
pub const SNAPSHOT_IMG: &str = "snapshot.img";
/// Staging tree inside each snapshot directory while in progress.
pub const SNAPSHOT_WORKDIR: &str = "snapshot.workdir";
/// Symlink naming the currently active snapshot.
pub const ACTIVE_SNAPSHOT: &str = "active";
/// Directory holding the passive snapshot symlinks.
pub const PASSIVES_DIR: &str = "passives";
/// Name prefix of passive snapshot symlinks.
pub const PASSIVE_PREFIX: &str = "passive_";
/// Default number of snapshots kept after a commit.
pub const MAX_SNAPS: usize = 4;
/// Default filesystem for snapshot images.
pub const DEFAULT_SNAPSHOT_FS: &str = "ext2";

/// Extra MiB added on top of the measured tree size when sizing images.
pub const IMG_OVERHEAD_MIB: u64 = 100;
/// Bounded retries when resolving a partition device by label.
pub const DEVICE_BY_LABEL_ATTEMPTS: u32 = 10;

/// Paths never copied out of a source tree.
pub const SYNC_EXCLUDES: &[&str] = &["/mnt", "/proc", "/sys", "/dev", "/tmp", "/host", "/run"];
/// Baseline mksquashfs arguments.
pub const DEFAULT_SQUASHFS_OPTS: &[&str] = &["-b", "1024k"];
/// Default mksquashfs compression arguments, overridable per runtime.
pub const DEFAULT_SQUASHFS_COMPRESSION: &[&str] = &["-comp", "xz"];

/// Mode for directories created by the engine.
pub const DIR_PERM: u32 = 0o755;
/// Mode for regular files written by the engine.
pub const FILE_PERM: u32 = 0o644;
/// Mode for cloud-init drop-ins.
pub const CLOUD_INIT_PERM: u32 = 0o600;
