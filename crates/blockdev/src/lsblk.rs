use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use serde::Deserialize;

use elemental_utils::Runner;

#[derive(Debug, Deserialize)]
struct DevicesOutput {
    blockdevices: Vec<Device>,
}

/// A block device as reported by `lsblk -J -b -O`.
#[derive(Debug, Clone, Deserialize)]
pub struct Device {
    pub name: String,
    pub path: Option<String>,
    pub label: Option<String>,
    pub partlabel: Option<String>,
    pub fstype: Option<String>,
    pub mountpoint: Option<String>,
    pub size: Option<u64>,
    pub children: Option<Vec<Device>>,
}

impl Device {
    // Older util-linux doesn't emit PATH, so we reconstruct it
    pub fn path(&self) -> String {
        self.path.clone().unwrap_or(format!("/dev/{}", &self.name))
    }

    pub fn has_children(&self) -> bool {
        self.children.as_ref().is_some_and(|v| !v.is_empty())
    }
}

#[context("Listing device {dev}")]
pub fn list_device(runner: &dyn Runner, dev: &Utf8Path) -> Result<Device> {
    let out = runner.run("lsblk", &["-J", "-b", "-O", dev.as_str()])?;
    let devs: DevicesOutput = serde_json::from_slice(&out).context("Parsing lsblk output")?;
    devs.blockdevices
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no device output from lsblk for {dev}"))
}

/// Resolve a device node by filesystem label, polling up to `attempts`
/// times one second apart. Device nodes for freshly created partitions can
/// lag behind the kernel event that announced them.
pub fn device_by_label(runner: &dyn Runner, label: &str, attempts: u32) -> Result<String> {
    for attempt in 1..=attempts {
        if let Ok(out) = runner.run("blkid", &["--label", label]) {
            let dev = String::from_utf8_lossy(&out).trim().to_string();
            if !dev.is_empty() {
                return Ok(dev);
            }
        }
        tracing::debug!("no device with label {label} yet (attempt {attempt}/{attempts})");
        if attempt < attempts {
            std::thread::sleep(Duration::from_secs(1));
        }
    }
    Err(anyhow!(
        "no device with label {label} found after {attempts} attempts"
    ))
}
