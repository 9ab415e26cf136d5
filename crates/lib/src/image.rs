//! Filesystem image lifecycle: creation, loopback mounting, and
//! population from docker, directory or file sources.

use std::sync::OnceLock;

use anyhow::{anyhow, bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use regex::Regex;

use elemental_blockdev::loopback;

use crate::consts;
use crate::spec::{Image, ImageSource};
use crate::util::{
    copy_file, cosign_verify, create_dir_structure, create_raw_file, create_squashfs,
    dir_size_mib, mkdir_all, sync_data,
};
use crate::Runtime;

fn is_ext_family(fs: &str) -> bool {
    static EXT: OnceLock<Regex> = OnceLock::new();
    EXT.get_or_init(|| Regex::new("^ext[2-4]$").unwrap()).is_match(fs)
}

/// Create and format the backing file of `img`. With `size` unset the
/// image is sized after `root_dir` plus a fixed overhead. With `preload`
/// the filesystem is populated from `root_dir` at format time, which only
/// the ext family supports.
#[context("Creating filesystem image {}", img.file)]
pub fn create_filesystem_image(
    rt: &Runtime,
    img: &mut Image,
    root_dir: Option<&Utf8Path>,
    preload: bool,
) -> Result<()> {
    tracing::info!("Creating image {}", img.file);
    if let Some(parent) = img.file.parent() {
        mkdir_all(parent)?;
    }

    if img.size == 0 {
        let root = root_dir.ok_or_else(|| anyhow!("no size and no source tree given"))?;
        img.size = dir_size_mib(root)? + consts::IMG_OVERHEAD_MIB;
        tracing::debug!("Image size {}M", img.size);
    }

    create_raw_file(&img.file, img.size)?;

    let mut extra_opts: Vec<&str> = Vec::new();
    if preload {
        if !is_ext_family(&img.filesystem) {
            tracing::error!("Preloaded filesystem images are only supported for ext2-4");
            bail!("unexpected filesystem for preloading: {}", img.filesystem);
        }
        let root = root_dir.ok_or_else(|| anyhow!("no source tree to preload from"))?;
        extra_opts.extend_from_slice(&["-d", root.as_str()]);
    }

    if let Err(e) = elemental_blockdev::format_device(
        rt.runner,
        &img.file,
        &img.filesystem,
        &img.label,
        &extra_opts,
    ) {
        tracing::error!("failed formatting file {} with {}", img.file, img.filesystem);
        let _ = std::fs::remove_file(&img.file);
        return Err(e);
    }
    Ok(())
}

/// Attach `img.file` to a loop device and mount it. The loop device is
/// recorded in the image and detached again if the mount fails.
#[context("Mounting image {} at {}", img.file, img.mountpoint)]
pub fn mount_filesystem_image(rt: &Runtime, img: &mut Image, options: &[&str]) -> Result<()> {
    tracing::debug!("Mounting image {} to {}", img.label, img.mountpoint);
    mkdir_all(&img.mountpoint)?;

    let loop_dev = loopback::attach(rt.runner, &img.file)?;
    let options: Vec<String> = options.iter().map(ToString::to_string).collect();
    if let Err(e) = rt
        .mounter
        .mount(loop_dev.as_str(), &img.mountpoint, "auto", &options)
    {
        tracing::error!("Failed to mount {loop_dev}");
        let _ = loopback::detach(rt.runner, &loop_dev);
        return Err(e);
    }
    img.loop_device = Some(loop_dev);
    Ok(())
}

/// Unmount `img` and release its loop device; does nothing if the
/// mountpoint is not active.
pub fn unmount_filesystem_image(rt: &Runtime, img: &mut Image) -> Result<()> {
    if !rt.mounter.is_mounted(&img.mountpoint).unwrap_or(false) {
        tracing::debug!(
            "Not unmounting image, {} doesn't look like mountpoint",
            img.mountpoint
        );
        return Ok(());
    }

    tracing::debug!("Unmounting image {} from {}", img.label, img.mountpoint);
    rt.mounter.unmount(&img.mountpoint)?;
    let result = match img.loop_device.as_deref() {
        Some(dev) => loopback::detach(rt.runner, dev),
        None => Ok(()),
    };
    img.loop_device = None;
    result
}

/// Materialise an image source under `target`. Returns the source digest
/// when one is known (docker sources).
#[context("Dumping source {source} into {target}")]
pub fn dump_source(
    rt: &Runtime,
    target: &Utf8Path,
    source: &ImageSource,
) -> Result<Option<String>> {
    tracing::info!("Copying {source} source...");
    mkdir_all(target)?;

    let digest = match source {
        ImageSource::Docker(imgref) => {
            if rt.cosign {
                tracing::info!("Running cosign verification for {imgref}");
                cosign_verify(rt.runner, imgref, rt.cosign_key.as_deref())
                    .context("Cosign verification failed")?;
            }
            let extractor = rt
                .extractor
                .ok_or_else(|| anyhow!("no image extractor configured"))?;
            let digest = extractor.extract_image(imgref, target, &rt.platform, rt.local_image)?;
            Some(digest)
        }
        ImageSource::Dir(dir) => {
            sync_data(rt.runner, dir, target, consts::SYNC_EXCLUDES)?;
            None
        }
        ImageSource::File(file) => {
            let staging = rt.imgsrc_dir();
            mkdir_all(&staging)?;
            let mut src_img = Image {
                file: file.clone(),
                mountpoint: staging.clone(),
                ..Default::default()
            };
            mount_filesystem_image(rt, &mut src_img, &["ro"])?;
            let synced = sync_data(rt.runner, &staging, target, consts::SYNC_EXCLUDES);
            if let Err(e) = unmount_filesystem_image(rt, &mut src_img) {
                tracing::warn!("failed releasing image source mount: {e:#}");
            }
            synced?;
            None
        }
        ImageSource::Empty => {
            tracing::debug!("Empty source, nothing to copy");
            None
        }
    };
    tracing::info!("Finished copying {source} into {target}");
    Ok(digest)
}

/// Cleanup handle for the staging trees of [`deploy_img_tree`]; runs on
/// every exit path of [`create_image_from_tree`].
#[derive(Debug)]
pub struct TreeCleaner {
    root: Utf8PathBuf,
    staging: Utf8PathBuf,
}

impl TreeCleaner {
    /// Unmount the tree bind and remove both directories.
    pub fn run(self, rt: &Runtime) -> Result<()> {
        let _ = rt.mounter.unmount(&self.root);
        std::fs::remove_dir_all(&self.root)
            .with_context(|| format!("Removing {}", self.root))?;
        std::fs::remove_dir_all(&self.staging)
            .with_context(|| format!("Removing {}", self.staging))?;
        Ok(())
    }
}

/// Stage the image source as a tree bind-mounted at `root`. The staging
/// directory lives next to `img.file` so the content ends up on the same
/// filesystem as the image. Returns the source digest and the cleaner
/// releasing the tree.
#[context("Deploying tree for image {}", img.file)]
pub fn deploy_img_tree(
    rt: &Runtime,
    img: &Image,
    root: &Utf8Path,
) -> Result<(Option<String>, TreeCleaner)> {
    tracing::info!("Preparing root tree for image: {}", img.file);
    let staging = img.file.with_extension("imgtree");
    mkdir_all(&staging)?;

    if let Err(e) = mkdir_all(root) {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(e);
    }
    let bind_opts = vec!["bind".to_string()];
    if let Err(e) = rt
        .mounter
        .mount(staging.as_str(), root, "bind", &bind_opts)
    {
        let _ = std::fs::remove_dir_all(&staging);
        let _ = std::fs::remove_dir_all(root);
        return Err(e);
    }

    let cleaner = TreeCleaner {
        root: root.to_owned(),
        staging,
    };

    let digest = match dump_source(rt, root, &img.source) {
        Ok(digest) => digest,
        Err(e) => {
            let _ = cleaner.run(rt);
            return Err(e);
        }
    };
    if let Err(e) = create_dir_structure(root) {
        let _ = cleaner.run(rt);
        return Err(e);
    }

    Ok((digest, cleaner))
}

/// Produce `img.file` from the tree at `root`: squashfs images through
/// mksquashfs, preloaded ext images at format time, anything else by
/// formatting empty and rsyncing into the mounted image. Every cleaner
/// runs regardless of the outcome; the first cleaner error surfaces if
/// nothing failed earlier.
pub fn create_image_from_tree(
    rt: &Runtime,
    img: &mut Image,
    root: &Utf8Path,
    preload: bool,
    cleaners: Vec<TreeCleaner>,
) -> Result<()> {
    let mut result = create_image_from_tree_inner(rt, img, root, preload);
    for cleaner in cleaners {
        if let Err(e) = cleaner.run(rt) {
            if result.is_ok() {
                result = Err(e);
            } else {
                tracing::warn!("cleanup failed: {e:#}");
            }
        }
    }
    result
}

fn create_image_from_tree_inner(
    rt: &Runtime,
    img: &mut Image,
    root: &Utf8Path,
    preload: bool,
) -> Result<()> {
    if img.filesystem == "squashfs" {
        tracing::info!("Creating squashfs image for file {}", img.file);
        if let Some(parent) = img.file.parent() {
            mkdir_all(parent)?;
        }
        let mut opts: Vec<&str> = consts::DEFAULT_SQUASHFS_OPTS.to_vec();
        if rt.squash_compression.is_empty() {
            opts.extend_from_slice(consts::DEFAULT_SQUASHFS_COMPRESSION);
        } else {
            opts.extend(rt.squash_compression.iter().map(String::as_str));
        }
        return create_squashfs(rt.runner, root, &img.file, &opts);
    }

    create_filesystem_image(rt, img, Some(root), preload)?;
    if !preload {
        mount_filesystem_image(rt, img, &["rw"])?;
        tracing::info!("Sync {} to {}", root, img.mountpoint);
        let synced = sync_data(rt.runner, root, &img.mountpoint, &[]);
        let unmounted = unmount_filesystem_image(rt, img);
        synced?;
        unmounted?;
    }
    Ok(())
}

/// Clone the file source of `img` as its backing file, refreshing the
/// filesystem label on the copy.
#[context("Copying image file {}", img.file)]
pub fn copy_file_img(rt: &Runtime, img: &Image) -> Result<()> {
    let ImageSource::File(src) = &img.source else {
        bail!("copying a file image requires an image source of file type");
    };
    if let Some(parent) = img.file.parent() {
        mkdir_all(parent)?;
    }
    tracing::info!("Copying image {src} to {}", img.file);
    copy_file(src, &img.file)?;

    if img.filesystem != "squashfs" && !img.label.is_empty() {
        tracing::info!("Setting label: {}", img.label);
        rt.runner
            .run("tune2fs", &["-L", &img.label, img.file.as_str()])?;
    }
    Ok(())
}

/// Deploy the configured source into a fresh image file: stage the tree,
/// pack it, clean everything up. Returns the source digest when known.
#[context("Deploying image {}", img.file)]
pub fn deploy_image(rt: &Runtime, img: &mut Image) -> Result<Option<String>> {
    tracing::info!("Deploying image: {}", img.file);
    let root = rt.staging_dir();
    let (digest, cleaner) = deploy_img_tree(rt, img, &root)?;
    create_image_from_tree(rt, img, &root, false, vec![cleaner])?;
    Ok(digest)
}
