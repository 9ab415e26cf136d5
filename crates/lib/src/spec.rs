//! The data model consumed by the engine. External configuration loading
//! is out of scope for this crate; these types are its deserialization
//! contract.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::consts;

/// A logical mount request for a volume identified by a device reference
/// (`LABEL=`, `PARTLABEL=`, `UUID=` or a `/dev/` path).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub device: String,
    /// Absolute path inside the future sysroot. Paths under `/run` are
    /// used verbatim instead of being rebased.
    pub mountpoint: Utf8PathBuf,
    #[serde(default)]
    pub options: Vec<String>,
    /// Marks the volume holding persistent state. At most one per spec.
    #[serde(default)]
    pub persistent: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EphemeralType {
    #[default]
    Tmpfs,
    Block,
}

/// Where the writable upper layers of ephemeral paths live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralMounts {
    #[serde(rename = "type", default)]
    pub kind: EphemeralType,
    /// tmpfs size, as accepted by mount(8) (`30%`, `2G`, ...).
    #[serde(default = "default_ephemeral_size")]
    pub size: String,
    /// Backing device for `block` workspaces.
    #[serde(default)]
    pub device: String,
    /// Absolute paths overlaid with an ephemeral upper layer.
    #[serde(default)]
    pub paths: Vec<Utf8PathBuf>,
}

fn default_ephemeral_size() -> String {
    "25%".to_string()
}

impl Default for EphemeralMounts {
    fn default() -> Self {
        Self {
            kind: EphemeralType::default(),
            size: default_ephemeral_size(),
            device: String::new(),
            paths: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistentMode {
    #[default]
    Overlay,
    Bind,
}

/// Paths whose state survives reboots, layered over the persistent volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentMounts {
    #[serde(default)]
    pub mode: PersistentMode,
    #[serde(default)]
    pub paths: Vec<Utf8PathBuf>,
}

/// Everything `run_mount` needs to assemble a sysroot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    pub sysroot: Utf8PathBuf,
    #[serde(default)]
    pub write_fstab: bool,
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    #[serde(default)]
    pub ephemeral: EphemeralMounts,
    #[serde(default)]
    pub persistent: PersistentMounts,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionTableKind {
    #[default]
    Gpt,
    Msdos,
}

impl PartitionTableKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionTableKind::Gpt => "gpt",
            PartitionTableKind::Msdos => "msdos",
        }
    }
}

/// One partition of the install layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub name: String,
    /// Device node; empty until resolved by partitioning or label lookup.
    #[serde(default)]
    pub path: Utf8PathBuf,
    /// Filesystem to format with; empty leaves the partition raw.
    #[serde(default)]
    pub filesystem: String,
    #[serde(default)]
    pub label: String,
    /// Empty means the partition is never mounted by the engine.
    #[serde(default)]
    pub mountpoint: Utf8PathBuf,
    /// Size in MiB; 0 on the last partition consumes the remainder.
    #[serde(default)]
    pub size: u64,
    /// parted flags such as `esp` or `bios_grub`.
    #[serde(default)]
    pub flags: Vec<String>,
}

/// Origin of an image's content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageSource {
    /// A container image reference, materialised through the configured
    /// extractor.
    Docker(String),
    /// A local directory tree.
    Dir(Utf8PathBuf),
    /// A local filesystem image file.
    File(Utf8PathBuf),
    /// No content; produces an empty filesystem.
    #[default]
    Empty,
}

impl ImageSource {
    pub fn is_empty(&self) -> bool {
        matches!(self, ImageSource::Empty)
    }
}

impl std::fmt::Display for ImageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageSource::Docker(r) => write!(f, "{r}"),
            ImageSource::Dir(p) => write!(f, "{p}"),
            ImageSource::File(p) => write!(f, "{p}"),
            ImageSource::Empty => write!(f, "empty"),
        }
    }
}

/// A filesystem image file and how to build or mount it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Path of the backing file.
    pub file: Utf8PathBuf,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub filesystem: String,
    /// Size in MiB; 0 derives it from the source tree.
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub mountpoint: Utf8PathBuf,
    #[serde(default)]
    pub source: ImageSource,
    /// Loop device backing the image while mounted.
    #[serde(skip)]
    pub loop_device: Option<Utf8PathBuf>,
}

/// One generation of the root filesystem under `.snapshots`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Monotonically assigned positive identifier; never reused.
    pub id: u32,
    /// The backing image file (`<snapshots>/<id>/snapshot.img`).
    pub path: Utf8PathBuf,
    /// Staging tree collecting the new generation's content.
    pub work_dir: Utf8PathBuf,
    /// Where the staging tree is bind-mounted while in progress.
    pub mount_point: Utf8PathBuf,
    pub in_progress: bool,
}

/// Tunables of the loop-device snapshotter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotterConfig {
    /// Retention bound applied after a commit.
    #[serde(default = "default_max_snaps")]
    pub max_snaps: usize,
    /// Filesystem of snapshot images; must be preloadable (ext family).
    #[serde(default = "default_snapshot_fs")]
    pub fs: String,
    /// Snapshot image size in MiB; 0 derives it from the staged tree.
    #[serde(default)]
    pub size: u64,
}

fn default_max_snaps() -> usize {
    consts::MAX_SNAPS
}

fn default_snapshot_fs() -> String {
    consts::DEFAULT_SNAPSHOT_FS.to_string()
}

impl Default for SnapshotterConfig {
    fn default() -> Self {
        Self {
            max_snaps: default_max_snaps(),
            fs: default_snapshot_fs(),
            size: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_spec_defaults() {
        let spec: MountSpec = serde_json::from_str(r#"{"sysroot": "/sysroot"}"#).unwrap();
        assert_eq!(spec.sysroot, "/sysroot");
        assert!(!spec.write_fstab);
        assert!(spec.volumes.is_empty());
        assert_eq!(spec.ephemeral.kind, EphemeralType::Tmpfs);
        assert_eq!(spec.ephemeral.size, "25%");
        assert_eq!(spec.persistent.mode, PersistentMode::Overlay);
    }

    #[test]
    fn test_ephemeral_block_roundtrip() {
        let e: EphemeralMounts = serde_json::from_str(
            r#"{"type": "block", "device": "/dev/vda4", "paths": ["/var/log"]}"#,
        )
        .unwrap();
        assert_eq!(e.kind, EphemeralType::Block);
        assert_eq!(e.device, "/dev/vda4");
        assert_eq!(e.paths, vec![Utf8PathBuf::from("/var/log")]);
    }

    #[test]
    fn test_unknown_persistent_mode_is_rejected() {
        let r: Result<PersistentMounts, _> =
            serde_json::from_str(r#"{"mode": "mirror", "paths": []}"#);
        assert!(r.is_err());
    }

    #[test]
    fn test_image_source_forms() {
        let s: ImageSource = serde_json::from_str(r#"{"docker": "quay.io/os/img:1"}"#).unwrap();
        assert_eq!(s, ImageSource::Docker("quay.io/os/img:1".into()));
        let s: ImageSource = serde_json::from_str(r#"{"dir": "/some/tree"}"#).unwrap();
        assert_eq!(s, ImageSource::Dir("/some/tree".into()));
        let s: ImageSource = serde_json::from_str(r#""empty""#).unwrap();
        assert!(s.is_empty());
        assert_eq!(ImageSource::default(), ImageSource::Empty);
    }

    #[test]
    fn test_snapshotter_config_defaults() {
        let c = SnapshotterConfig::default();
        assert_eq!(c.max_snaps, 4);
        assert_eq!(c.fs, "ext2");
        assert_eq!(c.size, 0);
    }
}
