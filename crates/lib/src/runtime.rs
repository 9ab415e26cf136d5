use camino::{Utf8Path, Utf8PathBuf};

use anyhow::Result;
use elemental_utils::Runner;

use crate::consts;
use crate::mounter::Mounter;

/// Contract required from the (externally provided) container image
/// extractor: materialise the rootfs of `imgref` under `target` for the
/// given platform, returning the image digest.
pub trait ImageExtractor {
    fn extract_image(
        &self,
        imgref: &str,
        target: &Utf8Path,
        platform: &str,
        local: bool,
    ) -> Result<String>;
}

/// The capability bundle handed to every engine operation. Constructing
/// one with fakes makes the whole engine run hermetically.
pub struct Runtime<'a> {
    pub runner: &'a dyn Runner,
    pub mounter: &'a dyn Mounter,
    /// Extractor for docker image sources; without one, such sources fail.
    pub extractor: Option<&'a dyn ImageExtractor>,
    /// Platform string forwarded to the extractor.
    pub platform: String,
    /// Enables cosign verification of docker sources.
    pub cosign: bool,
    /// Public key for cosign; keyless verification when unset.
    pub cosign_key: Option<Utf8PathBuf>,
    /// Tells the extractor to only consult local storage.
    pub local_image: bool,
    /// Overrides the default mksquashfs compression arguments.
    pub squash_compression: Vec<String>,
    /// Root of the engine's runtime state, `/run/elemental` on a host.
    pub run_root: Utf8PathBuf,
}

impl<'a> Runtime<'a> {
    pub fn new(runner: &'a dyn Runner, mounter: &'a dyn Mounter) -> Self {
        Self {
            runner,
            mounter,
            extractor: None,
            platform: "linux/amd64".to_string(),
            cosign: false,
            cosign_key: None,
            local_image: false,
            squash_compression: Vec::new(),
            run_root: Utf8PathBuf::from(consts::RUN_ELEMENTAL_DIR),
        }
    }

    /// Workspace holding ephemeral overlay upper/work directories.
    pub fn overlay_dir(&self) -> Utf8PathBuf {
        self.run_root.join(consts::OVERLAY_DIRNAME)
    }

    /// Mountpoint of staging trees while images are being assembled.
    pub fn staging_dir(&self) -> Utf8PathBuf {
        self.run_root.join(consts::STAGING_DIRNAME)
    }

    /// Mountpoint used to read file image sources.
    pub fn imgsrc_dir(&self) -> Utf8PathBuf {
        self.run_root.join(consts::IMGSRC_DIRNAME)
    }
}
