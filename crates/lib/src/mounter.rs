//! The mount-table capability. All mounting goes through mount(8) and
//! umount(8); the kernel mount table is read back from
//! `/proc/self/mounts`.

use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use elemental_utils::CommandRunExt;

/// One row of a mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: Utf8PathBuf,
    pub fstype: String,
    pub options: Vec<String>,
}

/// Capability object over the kernel mount table.
pub trait Mounter {
    fn mount(
        &self,
        source: &str,
        target: &Utf8Path,
        fstype: &str,
        options: &[String],
    ) -> Result<()>;

    fn unmount(&self, target: &Utf8Path) -> Result<()>;

    /// Whether `target` is a mountpoint. Bind mounts of the same
    /// filesystem are not distinguished.
    fn is_mounted(&self, target: &Utf8Path) -> Result<bool>;
}

/// [`Mounter`] operating on the host via the system tools.
#[derive(Debug, Default)]
pub struct HostMounter;

/// Decode the octal escapes (`\040` and friends) used by
/// `/proc/self/mounts` fields.
fn unescape_mount_field(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            let digits: String = chars.clone().take(3).collect();
            if digits.len() == 3 {
                if let Ok(v) = u8::from_str_radix(&digits, 8) {
                    out.push(v as char);
                    chars.nth(2);
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

impl HostMounter {
    fn proc_mounts(&self) -> Result<Vec<MountEntry>> {
        let data =
            std::fs::read_to_string("/proc/self/mounts").context("Reading /proc/self/mounts")?;
        Ok(parse_proc_mounts(&data))
    }
}

pub(crate) fn parse_proc_mounts(data: &str) -> Vec<MountEntry> {
    let mut entries = Vec::new();
    for line in data.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        entries.push(MountEntry {
            source: unescape_mount_field(fields[0]),
            target: Utf8PathBuf::from(unescape_mount_field(fields[1])),
            fstype: fields[2].to_string(),
            options: fields[3].split(',').map(ToString::to_string).collect(),
        });
    }
    entries
}

impl Mounter for HostMounter {
    fn mount(
        &self,
        source: &str,
        target: &Utf8Path,
        fstype: &str,
        options: &[String],
    ) -> Result<()> {
        let mut cmd = Command::new("mount");
        if !fstype.is_empty() {
            cmd.args(["-t", fstype]);
        }
        if !options.is_empty() {
            cmd.args(["-o", &options.join(",")]);
        }
        cmd.arg(source);
        cmd.arg(target.as_str());
        cmd.log_debug()
            .run_capture_stderr()
            .with_context(|| format!("Mounting {source} at {target}"))
    }

    fn unmount(&self, target: &Utf8Path) -> Result<()> {
        Command::new("umount")
            .arg(target.as_str())
            .log_debug()
            .run_capture_stderr()
            .with_context(|| format!("Unmounting {target}"))
    }

    fn is_mounted(&self, target: &Utf8Path) -> Result<bool> {
        Ok(self.proc_mounts()?.iter().any(|e| e.target == target))
    }
}
