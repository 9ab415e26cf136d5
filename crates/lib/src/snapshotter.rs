//! Loop-device snapshotter: numbered generations of root filesystem
//! images under `<root>/.snapshots`, promoted by a symlink swap and
//! pruned by a bounded retention walk.

use std::os::unix::fs::symlink;

use anyhow::{anyhow, bail, Context, Result};
use camino::Utf8PathBuf;
use fn_error_context::context;

use crate::consts;
use crate::image::create_image_from_tree;
use crate::spec::{Image, ImageSource, Snapshot, SnapshotterConfig};
use crate::util::mkdir_all;
use crate::Runtime;

/// Snapshotter keeping each generation as a loop-mountable image file.
pub struct LoopDeviceSnapshotter<'r, 'a> {
    rt: &'r Runtime<'a>,
    root: Utf8PathBuf,
    config: SnapshotterConfig,
}

impl<'r, 'a> LoopDeviceSnapshotter<'r, 'a> {
    /// Create a snapshotter over `<root>/.snapshots`. The configured
    /// filesystem must support preloading (ext family) and at least one
    /// snapshot must be retained.
    pub fn new(
        rt: &'r Runtime<'a>,
        root: impl Into<Utf8PathBuf>,
        config: SnapshotterConfig,
    ) -> Result<Self> {
        if config.max_snaps < 1 {
            bail!("at least one snapshot must be retained");
        }
        if !matches!(config.fs.as_str(), "ext2" | "ext3" | "ext4") {
            bail!("unsupported snapshot filesystem: {}", config.fs);
        }
        Ok(Self {
            rt,
            root: root.into(),
            config,
        })
    }

    fn snapshots_dir(&self) -> Utf8PathBuf {
        self.root.join(consts::SNAPSHOTS_DIR)
    }

    fn snapshot_dir(&self, id: u32) -> Utf8PathBuf {
        self.snapshots_dir().join(id.to_string())
    }

    fn passive_link(&self, id: u32) -> Utf8PathBuf {
        self.snapshots_dir()
            .join(consts::PASSIVES_DIR)
            .join(format!("{}{id}", consts::PASSIVE_PREFIX))
    }

    /// Create the snapshot tree if it is not there yet.
    #[context("Initializing snapshotter at {}", self.root)]
    pub fn init(&self) -> Result<()> {
        mkdir_all(&self.snapshots_dir().join(consts::PASSIVES_DIR))
    }

    /// The ids present under `.snapshots`, ascending.
    #[context("Listing snapshots under {}", self.root)]
    pub fn get_snapshots(&self) -> Result<Vec<u32>> {
        let mut ids = Vec::new();
        for entry in self.snapshots_dir().read_dir_utf8()? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Ok(id) = entry.file_name().parse::<u32>() {
                if id > 0 {
                    ids.push(id);
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// The id the `active` symlink points at, if any. A link whose target
    /// is gone is an error; the tree is unusable until repaired.
    pub fn active_id(&self) -> Result<Option<u32>> {
        let link = self.snapshots_dir().join(consts::ACTIVE_SNAPSHOT);
        match link.symlink_metadata() {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Inspecting {link}")),
        }
        let target = link
            .read_link_utf8()
            .with_context(|| format!("Reading {link}"))?;
        let resolved = self.snapshots_dir().join(&target);
        if !resolved.exists() {
            bail!("active snapshot link is broken: {target}: no such file or directory");
        }
        let id = target
            .components()
            .next()
            .and_then(|c| c.as_str().parse::<u32>().ok())
            .ok_or_else(|| anyhow!("unexpected active snapshot target {target}"))?;
        Ok(Some(id))
    }

    /// Open a transaction for the next generation: allocate its id,
    /// create its directory and bind-mount a staging tree for the caller
    /// to fill.
    #[context("Starting snapshot transaction")]
    pub fn start_transaction(&self) -> Result<Snapshot> {
        let ids = self.get_snapshots()?;
        // A broken active link means we cannot tell what is booted
        self.active_id()?;

        let id = ids.last().map(|m| m + 1).unwrap_or(1);
        let dir = self.snapshot_dir(id);
        let work_dir = dir.join(consts::SNAPSHOT_WORKDIR);
        mkdir_all(&work_dir)?;

        let mount_point = self.rt.staging_dir();
        mkdir_all(&mount_point)?;
        let bind_opts = vec!["bind".to_string()];
        self.rt
            .mounter
            .mount(work_dir.as_str(), &mount_point, "bind", &bind_opts)
            .with_context(|| format!("Binding snapshot {id} staging tree"))?;

        tracing::info!("Started transaction for snapshot {id}");
        Ok(Snapshot {
            id,
            path: dir.join(consts::SNAPSHOT_IMG),
            work_dir,
            mount_point,
            in_progress: true,
        })
    }

    /// Commit a transaction: pack the staged tree into the snapshot
    /// image, promote it to `active`, refresh the passive links and prune
    /// old generations. A snapshot that is not in progress is dropped
    /// without side effects. On failure the previous `active` is left
    /// untouched.
    #[context("Closing transaction for snapshot {}", snap.id)]
    pub fn close_transaction(&self, snap: &mut Snapshot) -> Result<()> {
        if !snap.in_progress {
            tracing::debug!("Snapshot {} is not in progress, nothing to close", snap.id);
            return Ok(());
        }
        tracing::info!("Closing transaction for snapshot {}", snap.id);

        // The generation the running system booted from; retention must
        // never remove it.
        let booted = self.active_id()?;

        let mut img = Image {
            file: snap.path.clone(),
            label: String::new(),
            filesystem: self.config.fs.clone(),
            size: self.config.size,
            mountpoint: Utf8PathBuf::new(),
            source: ImageSource::Dir(snap.work_dir.clone()),
            loop_device: None,
        };
        create_image_from_tree(self.rt, &mut img, &snap.work_dir, true, vec![])?;

        self.rt
            .mounter
            .unmount(&snap.mount_point)
            .with_context(|| format!("Releasing snapshot {} staging tree", snap.id))?;
        std::fs::remove_dir_all(&snap.work_dir)
            .with_context(|| format!("Removing {}", snap.work_dir))?;

        self.promote(snap.id)?;
        snap.in_progress = false;

        self.cleanup_old_snapshots(booted)?;
        Ok(())
    }

    /// Point `active` at the new generation with a tmp-link-and-rename
    /// swap, then make sure every other generation has its passive link.
    fn promote(&self, id: u32) -> Result<()> {
        let dir = self.snapshots_dir();
        let target = format!("{id}/{}", consts::SNAPSHOT_IMG);
        let tmp = dir.join(".active.tmp");
        if tmp.symlink_metadata().is_ok() {
            std::fs::remove_file(&tmp)?;
        }
        symlink(&target, &tmp).with_context(|| format!("Linking {tmp} to {target}"))?;
        std::fs::rename(&tmp, dir.join(consts::ACTIVE_SNAPSHOT))
            .context("Swapping active snapshot link")?;
        tracing::info!("Active snapshot is now {id}");

        mkdir_all(&dir.join(consts::PASSIVES_DIR))?;
        for old in self.get_snapshots()? {
            if old == id {
                continue;
            }
            let link = self.passive_link(old);
            if link.symlink_metadata().is_err() {
                let target = format!("../{old}/{}", consts::SNAPSHOT_IMG);
                symlink(&target, &link)
                    .with_context(|| format!("Linking {link} to {target}"))?;
            }
        }
        Ok(())
    }

    /// Walk snapshots ascending and delete until the retention bound is
    /// met. The walk stops early at the booted or active generation,
    /// which always survive even when that leaves more than `max_snaps`
    /// snapshots behind.
    fn cleanup_old_snapshots(&self, booted: Option<u32>) -> Result<()> {
        let active = self.active_id()?;
        let mut ids = self.get_snapshots()?;

        for id in ids.clone() {
            if ids.len() <= self.config.max_snaps {
                break;
            }
            if Some(id) == booted || Some(id) == active {
                tracing::debug!("Not cleaning up past snapshot {id}, it is in use");
                break;
            }
            self.remove_snapshot(id)?;
            tracing::info!("Removed snapshot {id}");
            ids.retain(|&i| i != id);
        }
        Ok(())
    }

    fn remove_snapshot(&self, id: u32) -> Result<()> {
        let link = self.passive_link(id);
        match std::fs::remove_file(&link) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("Removing {link}")),
        }
        std::fs::remove_dir_all(self.snapshot_dir(id))
            .with_context(|| format!("Removing snapshot {id}"))
    }

    /// Best-effort release of a failed transaction: unmount the staging
    /// tree and drop the half-built snapshot directory. Safe to call with
    /// nothing.
    pub fn close_transaction_on_error(&self, snap: Option<&Snapshot>) -> Result<()> {
        let Some(snap) = snap else {
            return Ok(());
        };
        tracing::info!("Closing failed transaction for snapshot {}", snap.id);

        let mut result = Ok(());
        if self
            .rt
            .mounter
            .is_mounted(&snap.mount_point)
            .unwrap_or(false)
        {
            result = self.rt.mounter.unmount(&snap.mount_point);
        }

        let dir = self.snapshot_dir(snap.id);
        if dir.exists() {
            let removed = std::fs::remove_dir_all(&dir)
                .with_context(|| format!("Removing snapshot {}", snap.id));
            if result.is_ok() {
                result = removed;
            }
        }
        result
    }

    /// Delete a passive snapshot and its link. The active snapshot is
    /// protected; deleting a snapshot that does not exist succeeds.
    #[context("Deleting snapshot {id}")]
    pub fn delete_snapshot(&self, id: u32) -> Result<()> {
        tracing::info!("Deleting snapshot {id}");
        if Some(id) == self.active_id()? {
            bail!("cannot delete the active snapshot {id}");
        }
        if !self.snapshot_dir(id).exists() {
            tracing::info!("nothing to delete, snapshot {id} does not exist");
            return Ok(());
        }
        self.remove_snapshot(id)
    }
}
