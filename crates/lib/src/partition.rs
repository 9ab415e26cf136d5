//! Partition lifecycle: table creation, formatting, and mount handling
//! with scope-guarded read-write access.

use anyhow::{bail, Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

use elemental_blockdev::{device_by_label, format_device, Disk};
use elemental_utils::join_errors;

use crate::consts;
use crate::spec::{Partition, PartitionTableKind};
use crate::util::mkdir_all;
use crate::Runtime;

/// Format an already existing partition.
#[context("Formatting partition {}", part.name)]
pub fn format_partition(rt: &Runtime, part: &Partition, extra_opts: &[&str]) -> Result<()> {
    tracing::info!("Formatting '{}' partition", part.name);
    format_device(
        rt.runner,
        &part.path,
        &part.filesystem,
        &part.label,
        extra_opts,
    )
}

/// Wipe the target disk, create a fresh partition table and realise the
/// given layout in order. Device nodes are recorded into each
/// [`Partition::path`].
#[context("Partitioning {target}")]
pub fn partition_and_format_device(
    rt: &Runtime,
    target: &Utf8Path,
    table: PartitionTableKind,
    parts: &mut [Partition],
) -> Result<()> {
    let disk = Disk::new(target, rt.runner);
    if !disk.exists() {
        tracing::error!("Disk {target} does not exist");
        bail!("disk {target} does not exist");
    }

    tracing::info!("Partitioning device...");
    disk.new_partition_table(table.as_str())
        .context("Failed creating new partition table")?;

    for part in parts.iter_mut() {
        create_and_format_partition(rt, &disk, part)?;
    }
    Ok(())
}

fn create_and_format_partition(rt: &Runtime, disk: &Disk, part: &mut Partition) -> Result<()> {
    tracing::debug!("Adding partition {}", part.name);
    let num = disk
        .add_partition(part.size, &part.filesystem, &part.name, &part.flags)
        .with_context(|| format!("Failed creating {} partition", part.name))?;
    let dev = disk.find_partition_device(num)?;
    if !part.filesystem.is_empty() {
        tracing::debug!("Formatting partition with label {}", part.label);
        format_device(rt.runner, &dev, &part.filesystem, &part.label, &[])
            .with_context(|| format!("Failed formatting partition {}", part.name))?;
    } else {
        tracing::debug!("Wiping filesystem on {}", part.name);
        disk.wipe_fs_on_partition(&dev)
            .with_context(|| format!("Failed to wipe filesystem of partition {dev}"))?;
    }
    part.path = dev;
    Ok(())
}

/// Mount all partitions carrying a mountpoint, read-write. On the first
/// failure everything already mounted is released again and the original
/// error returned.
#[context("Mounting disk partitions")]
pub fn mount_partitions(rt: &Runtime, parts: &mut [Partition]) -> Result<()> {
    tracing::info!("Mounting disk partitions");
    for i in 0..parts.len() {
        if parts[i].mountpoint.as_str().is_empty() {
            continue;
        }
        if let Err(e) = mount_partition(rt, &mut parts[i], &["rw"]) {
            let _ = unmount_partitions(rt, parts);
            return Err(e);
        }
    }
    Ok(())
}

/// Unmount all partitions carrying a mountpoint, attempting every one and
/// aggregating the failures.
pub fn unmount_partitions(rt: &Runtime, parts: &[Partition]) -> Result<()> {
    tracing::info!("Unmounting disk partitions");
    let mut errs = Vec::new();
    for part in parts {
        if part.mountpoint.as_str().is_empty() {
            continue;
        }
        if let Err(e) = unmount_partition(rt, part) {
            errs.push(e.context(format!("Failed to unmount {}", part.mountpoint)));
        }
    }
    join_errors(errs)
}

/// Whether the partition is currently mounted at its mountpoint.
pub fn is_mounted(rt: &Runtime, part: &Partition) -> Result<bool> {
    if part.mountpoint.as_str().is_empty() {
        return Ok(false);
    }
    rt.mounter.is_mounted(&part.mountpoint)
}

/// Mount a partition with the given options, resolving its device node by
/// filesystem label when unset.
#[context("Mounting partition {}", part.label)]
pub fn mount_partition(rt: &Runtime, part: &mut Partition, options: &[&str]) -> Result<()> {
    tracing::debug!("Mounting partition {}", part.label);
    mkdir_all(&part.mountpoint)?;
    if part.path.as_str().is_empty() {
        let device = device_by_label(rt.runner, &part.label, consts::DEVICE_BY_LABEL_ATTEMPTS)
            .with_context(|| format!("Could not find a device with label {}", part.label))?;
        part.path = device.into();
    }
    let options: Vec<String> = options.iter().map(ToString::to_string).collect();
    rt.mounter
        .mount(part.path.as_str(), &part.mountpoint, "auto", &options)
        .with_context(|| {
            format!(
                "Failed mounting device {} with label {}",
                part.path, part.label
            )
        })
}

/// Unmount the given partition, or do nothing if it is not mounted.
pub fn unmount_partition(rt: &Runtime, part: &Partition) -> Result<()> {
    if !is_mounted(rt, part).unwrap_or(false) {
        tracing::debug!(
            "Not unmounting partition, {} doesn't look like mountpoint",
            part.mountpoint
        );
        return Ok(());
    }
    tracing::debug!("Unmounting partition {}", part.label);
    rt.mounter.unmount(&part.mountpoint)
}

/// How a [`PartitionMountGuard`] restores the previous state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GuardRelease {
    RemountRo,
    Unmount,
}

/// Scope guard for read-write access to a partition, returned by
/// [`mount_rw_partition`]. Consuming it with [`Self::release`] restores
/// the state found at acquisition; dropping it releases best-effort.
pub struct PartitionMountGuard<'r, 'a> {
    rt: &'r Runtime<'a>,
    part: Option<Partition>,
    mode: GuardRelease,
}

impl PartitionMountGuard<'_, '_> {
    fn impl_release(&mut self) -> Result<()> {
        // SAFETY: this is the only place taking the option
        let Some(mut part) = self.part.take() else {
            return Ok(());
        };
        match self.mode {
            GuardRelease::RemountRo => mount_partition(self.rt, &mut part, &["remount", "ro"]),
            GuardRelease::Unmount => unmount_partition(self.rt, &part),
        }
    }

    /// Consume the guard, restoring the pre-acquisition mount state.
    pub fn release(mut self) -> Result<()> {
        self.impl_release()
    }
}

impl Drop for PartitionMountGuard<'_, '_> {
    fn drop(&mut self) {
        // Best effort if release() was never called
        let _ = self.impl_release();
    }
}

/// Get read-write access to a partition: an already mounted one is
/// remounted rw (and restored to ro on release), an unmounted one is
/// freshly mounted (and unmounted on release).
pub fn mount_rw_partition<'r, 'a>(
    rt: &'r Runtime<'a>,
    part: &mut Partition,
) -> Result<PartitionMountGuard<'r, 'a>> {
    let mode = if is_mounted(rt, part).unwrap_or(false) {
        mount_partition(rt, part, &["remount", "rw"])
            .with_context(|| format!("failed remounting {} partition", part.name))?;
        GuardRelease::RemountRo
    } else {
        mount_partition(rt, part, &["rw"])
            .with_context(|| format!("failed mounting {} partition", part.name))?;
        GuardRelease::Unmount
    };
    Ok(PartitionMountGuard {
        rt,
        part: Some(part.clone()),
        mode,
    })
}

/// Deactivate unmounted block devices (LVM volumes and device-mapper
/// targets) so repartitioning does not race against them.
pub fn deactivate_devices(rt: &Runtime) -> Result<()> {
    let out = rt.runner.run(
        "blkdeactivate",
        &[
            "--lvmoptions",
            "retry,wholevg",
            "--dmoptions",
            "force,retry",
            "--errors",
        ],
    )?;
    tracing::debug!(
        "blkdeactivate command output: {}",
        String::from_utf8_lossy(&out)
    );
    Ok(())
}

/// Whether any of the given filesystem labels is present in the system.
pub fn check_active_deployment(rt: &Runtime, labels: &[&str]) -> bool {
    tracing::info!("Checking for active deployment");
    for label in labels {
        if device_by_label(rt.runner, label, 1).is_ok() {
            tracing::debug!("there is already an active deployment in the system");
            return true;
        }
    }
    false
}
