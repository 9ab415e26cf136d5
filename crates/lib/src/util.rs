//! Filesystem and tool helpers shared by the engine modules.

use std::os::unix::fs::PermissionsExt;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use elemental_utils::Runner;

use crate::consts;
use crate::partition;
use crate::spec::Partition;
use crate::Runtime;

/// Create a directory and all of its parents.
pub fn mkdir_all(path: &Utf8Path) -> Result<()> {
    std::fs::create_dir_all(path).with_context(|| format!("Creating directory {path}"))
}

/// Copy a single file, preserving nothing but its content.
pub fn copy_file(src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
    std::fs::copy(src, dst)
        .map(|_| ())
        .with_context(|| format!("Copying {src} to {dst}"))
}

/// Mirror `src` into `dst` with rsync. `excludes` are source-relative
/// absolute paths left behind.
#[context("Syncing {src} to {dst}")]
pub fn sync_data(
    runner: &dyn Runner,
    src: &Utf8Path,
    dst: &Utf8Path,
    excludes: &[&str],
) -> Result<()> {
    // A trailing slash makes rsync copy the content rather than the dir.
    let src = format!("{}/", src.as_str().trim_end_matches('/'));
    let mut args = vec!["--archive", "--xattrs", "--acls", "--partial"];
    let excl: Vec<String> = excludes.iter().map(|e| format!("--exclude={e}")).collect();
    args.extend(excl.iter().map(String::as_str));
    args.push(&src);
    args.push(dst.as_str());
    runner.run("rsync", &args)?;
    Ok(())
}

fn dir_size_bytes(path: &Utf8Path) -> Result<u64> {
    let mut total = 0u64;
    for entry in path
        .read_dir_utf8()
        .with_context(|| format!("Reading directory {path}"))?
    {
        let entry = entry?;
        let meta = entry
            .path()
            .symlink_metadata()
            .with_context(|| format!("Inspecting {}", entry.path()))?;
        if meta.is_dir() {
            total += dir_size_bytes(entry.path())?;
        } else {
            total += meta.len();
        }
    }
    Ok(total)
}

/// Size of a directory tree, rounded up to whole MiB.
pub fn dir_size_mib(path: &Utf8Path) -> Result<u64> {
    let bytes = dir_size_bytes(path)?;
    Ok(bytes.div_ceil(1024 * 1024))
}

/// Allocate a raw file of `size_mib` MiB.
#[context("Creating raw file {path}")]
pub fn create_raw_file(path: &Utf8Path, size_mib: u64) -> Result<()> {
    let f = std::fs::File::create(path)?;
    f.set_len(size_mib * 1024 * 1024)?;
    Ok(())
}

/// Ensure the standard top-level directories of a root tree exist.
#[context("Creating directory structure under {root}")]
pub fn create_dir_structure(root: &Utf8Path) -> Result<()> {
    for dir in ["boot", "dev", "mnt", "proc", "run", "sys", "usr/local"] {
        mkdir_all(&root.join(dir))?;
    }
    let tmp = root.join("tmp");
    mkdir_all(&tmp)?;
    std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o1777))
        .with_context(|| format!("Setting permissions on {tmp}"))?;
    Ok(())
}

/// Verify a container image signature with cosign, returning the tool's
/// output.
#[context("Verifying signature of {imgref}")]
pub fn cosign_verify(
    runner: &dyn Runner,
    imgref: &str,
    key: Option<&Utf8Path>,
) -> Result<String> {
    let mut args = vec!["verify"];
    if let Some(key) = key {
        args.extend_from_slice(&["--key", key.as_str()]);
    }
    args.push(imgref);
    runner.run_get_string("cosign", &args)
}

/// Pack `root` into a squashfs image at `file`.
#[context("Creating squashfs image {file}")]
pub fn create_squashfs(
    runner: &dyn Runner,
    root: &Utf8Path,
    file: &Utf8Path,
    opts: &[&str],
) -> Result<()> {
    let mut args = vec![root.as_str(), file.as_str()];
    args.extend_from_slice(opts);
    runner.run("mksquashfs", &args)?;
    Ok(())
}

/// Pick a base for engine scratch directories: `TMPDIR` if set, the
/// persistent volume when it is mounted, `/tmp` otherwise.
pub fn temp_dir(rt: &Runtime, suffix: &str, persistent: Option<&Partition>) -> Utf8PathBuf {
    let suffix = if suffix.is_empty() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();
        format!("{}{nanos}", std::process::id())
    } else {
        suffix.to_string()
    };
    let name = format!("elemental-{suffix}");
    if let Ok(dir) = std::env::var("TMPDIR") {
        if !dir.is_empty() {
            tracing::debug!("Using TMPDIR for scratch space: {dir}");
            return Utf8PathBuf::from(dir).join(name);
        }
    }
    if let Some(part) = persistent {
        if partition::is_mounted(rt, part).unwrap_or(false) {
            tracing::debug!("Using persistent volume for scratch space");
            return part.mountpoint.join("tmp").join(name);
        }
    }
    Utf8PathBuf::from("/tmp").join(name)
}

/// Install cloud-init drop-ins under `target` as numbered custom files
/// readable only by the owner.
#[context("Copying cloud config files to {target}")]
pub fn copy_cloud_config(files: &[Utf8PathBuf], target: &Utf8Path) -> Result<()> {
    if target.as_str().is_empty() {
        tracing::warn!("empty target path, will not copy cloud config files");
        return Ok(());
    }
    mkdir_all(target)?;
    for (i, src) in files.iter().enumerate() {
        let dst = target.join(format!("9{i}_custom.yaml"));
        copy_file(src, &dst)?;
        std::fs::set_permissions(
            &dst,
            std::fs::Permissions::from_mode(consts::CLOUD_INIT_PERM),
        )?;
        tracing::info!("Copied cloud config file {src} to {dst}");
    }
    Ok(())
}
