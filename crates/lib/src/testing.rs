//! Test doubles for driving the engine hermetically.

pub use elemental_utils::testing::FakeRunner;

use std::cell::{Cell, RefCell};

use anyhow::{anyhow, Result};
use camino::{Utf8Path, Utf8PathBuf};

use crate::mounter::{MountEntry, Mounter};

/// A [`Mounter`] keeping an in-memory mount table.
#[derive(Debug, Default)]
pub struct FakeMounter {
    table: RefCell<Vec<MountEntry>>,
    /// Fail every subsequent mount.
    pub error_on_mount: Cell<bool>,
    /// Fail every subsequent unmount.
    pub error_on_unmount: Cell<bool>,
    fail_targets: RefCell<Vec<Utf8PathBuf>>,
}

impl FakeMounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail mounts onto this specific target.
    pub fn fail_mount_on(&self, target: impl Into<Utf8PathBuf>) {
        self.fail_targets.borrow_mut().push(target.into());
    }

    /// Snapshot of the current mount table.
    pub fn mounts(&self) -> Vec<MountEntry> {
        self.table.borrow().clone()
    }

    pub fn mount_count(&self) -> usize {
        self.table.borrow().len()
    }

    /// The most recent still-mounted entry for `target`.
    pub fn entry_for(&self, target: &Utf8Path) -> Option<MountEntry> {
        self.table
            .borrow()
            .iter()
            .rev()
            .find(|e| e.target == target)
            .cloned()
    }
}

impl Mounter for FakeMounter {
    fn mount(
        &self,
        source: &str,
        target: &Utf8Path,
        fstype: &str,
        options: &[String],
    ) -> Result<()> {
        if self.error_on_mount.get() || self.fail_targets.borrow().iter().any(|t| t == target) {
            return Err(anyhow!("mount of {target} failed"));
        }
        let mut table = self.table.borrow_mut();
        // A remount updates the existing entry instead of stacking a new one
        if options.iter().any(|o| o == "remount") {
            let Some(pos) = table.iter().rposition(|e| e.target == target) else {
                return Err(anyhow!("remount of {target} which is not mounted"));
            };
            table[pos].options = options.to_vec();
            return Ok(());
        }
        table.push(MountEntry {
            source: source.to_string(),
            target: target.to_owned(),
            fstype: fstype.to_string(),
            options: options.to_vec(),
        });
        Ok(())
    }

    fn unmount(&self, target: &Utf8Path) -> Result<()> {
        if self.error_on_unmount.get() {
            return Err(anyhow!("unmount of {target} failed"));
        }
        let mut table = self.table.borrow_mut();
        if let Some(pos) = table.iter().rposition(|e| e.target == target) {
            table.remove(pos);
        } else {
            tracing::debug!("unmount of {target} which is not mounted");
        }
        Ok(())
    }

    fn is_mounted(&self, target: &Utf8Path) -> Result<bool> {
        Ok(self.table.borrow().iter().any(|e| e.target == target))
    }
}
