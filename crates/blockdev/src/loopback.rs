//! Loop device attach/detach via losetup.

use anyhow::{anyhow, Result};
use camino::{Utf8Path, Utf8PathBuf};

use elemental_utils::Runner;

/// Attach `file` to the first free loop device and return the device path.
pub fn attach(runner: &dyn Runner, file: &Utf8Path) -> Result<Utf8PathBuf> {
    let dev = runner.run_get_string("losetup", &["--show", "-f", file.as_str()])?;
    if dev.is_empty() {
        return Err(anyhow!("losetup returned no device for {file}"));
    }
    tracing::debug!("Allocated loopback {dev} for {file}");
    Ok(Utf8PathBuf::from(dev))
}

/// Detach a loop device previously returned by [`attach`].
pub fn detach(runner: &dyn Runner, dev: &Utf8Path) -> Result<()> {
    runner.run("losetup", &["-d", dev.as_str()])?;
    Ok(())
}
