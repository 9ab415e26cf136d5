//! First-boot assembly of the sysroot: volumes, ephemeral overlays,
//! persistent state, and the fstab describing all of it.

use std::os::unix::fs::PermissionsExt;
use std::sync::OnceLock;

use anyhow::{anyhow, bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use regex::Regex;

use elemental_utils::{join_errors, Runner};

use crate::consts;
use crate::spec::{EphemeralMounts, EphemeralType, MountSpec, PersistentMode, PersistentMounts, VolumeMount};
use crate::util::{mkdir_all, sync_data};
use crate::Runtime;

const LABEL_PREF: &str = "LABEL=";
const PARTLABEL_PREF: &str = "PARTLABEL=";
const UUID_PREF: &str = "UUID=";
const DEV_PREF: &str = "/dev/";
const DISK_BY_LABEL: &str = "/dev/disk/by-label";
const DISK_BY_PARTLABEL: &str = "/dev/disk/by-partlabel";
const DISK_BY_UUID: &str = "/dev/disk/by-uuid";
const RUN_PATH: &str = "/run";

/// Map a volume device reference to the device path it names.
pub fn resolve_device_reference(device: &str) -> Result<Utf8PathBuf> {
    if let Some(label) = device.strip_prefix(LABEL_PREF) {
        Ok(Utf8Path::new(DISK_BY_LABEL).join(label))
    } else if let Some(label) = device.strip_prefix(PARTLABEL_PREF) {
        Ok(Utf8Path::new(DISK_BY_PARTLABEL).join(label))
    } else if let Some(uuid) = device.strip_prefix(UUID_PREF) {
        Ok(Utf8Path::new(DISK_BY_UUID).join(uuid))
    } else if device.starts_with(DEV_PREF) {
        Ok(Utf8PathBuf::from(device))
    } else {
        Err(anyhow!(
            "unknown device reference {device:?}, expected LABEL, PARTLABEL, UUID or a /dev/ path"
        ))
    }
}

/// `/a/b` -> `a-b`; the name under which a path's overlay or bind state
/// lives inside a workspace directory.
pub(crate) fn mangle_path(path: &Utf8Path) -> String {
    path.as_str().trim_start_matches('/').replace('/', "-")
}

/// Join `path` under `sysroot` unless it lives under `/run`, which always
/// names the running system.
fn rebase_path(sysroot: &Utf8Path, path: &Utf8Path) -> Utf8PathBuf {
    if path.as_str().starts_with(RUN_PATH) {
        path.to_owned()
    } else {
        sysroot.join(path.as_str().trim_start_matches('/'))
    }
}

/// Mount everything described by `spec` and, when requested, write the
/// fstab reflecting it. Volume mounting aggregates per-volume failures;
/// everything afterwards is fail-fast.
#[context("Mounting sysroot {}", spec.sysroot)]
pub fn run_mount(rt: &Runtime, spec: &MountSpec) -> Result<()> {
    tracing::info!("Running mount command");

    if spec.volumes.iter().filter(|v| v.persistent).count() > 1 {
        bail!("more than one persistent volume configured");
    }

    let fstab_data = if spec.write_fstab {
        tracing::debug!("Generating initial sysroot fstab lines");
        initial_fstab_data(rt, &spec.sysroot)?
    } else {
        String::new()
    };

    tracing::debug!("Mounting volumes");
    mount_volumes(rt, &spec.sysroot, &spec.volumes)?;

    tracing::debug!("Mounting ephemeral directories");
    mount_ephemeral(rt, &spec.sysroot, &spec.ephemeral)?;

    tracing::debug!("Mounting persistent directories");
    mount_persistent(rt, &spec.sysroot, &spec.persistent, &spec.volumes)?;

    if spec.write_fstab {
        tracing::debug!("Writing fstab");
        write_fstab(rt, spec, &fstab_data)?;
    }

    tracing::info!("Mount command finished successfully");
    Ok(())
}

/// Mount the configured volumes. Failures are collected so that every
/// volume is still attempted, and returned combined.
pub fn mount_volumes(rt: &Runtime, sysroot: &Utf8Path, volumes: &[VolumeMount]) -> Result<()> {
    let mut errs = Vec::new();

    for vol in volumes {
        let dev = match resolve_device_reference(&vol.device) {
            Ok(dev) => dev,
            Err(e) => {
                tracing::error!("{e}");
                errs.push(e);
                continue;
            }
        };
        let mountpoint = rebase_path(sysroot, &vol.mountpoint);
        if let Err(e) = mkdir_all(&mountpoint) {
            tracing::error!("failed creating mountpoint {mountpoint}");
            errs.push(e);
            continue;
        }
        if let Err(e) = rt
            .mounter
            .mount(dev.as_str(), &mountpoint, "auto", &vol.options)
        {
            tracing::error!("failed mounting device {dev} to {mountpoint}");
            errs.push(e);
        }
    }
    join_errors(errs)
}

/// Mount the ephemeral overlay workspace and overlay each configured path
/// with it.
#[context("Mounting ephemeral overlays")]
pub fn mount_ephemeral(rt: &Runtime, sysroot: &Utf8Path, ephemeral: &EphemeralMounts) -> Result<()> {
    let overlay_dir = rt.overlay_dir();
    mkdir_all(&overlay_dir)?;

    match ephemeral.kind {
        EphemeralType::Tmpfs => {
            let options = vec!["defaults".to_string(), format!("size={}", ephemeral.size)];
            rt.mounter
                .mount("tmpfs", &overlay_dir, "tmpfs", &options)
                .context("Mounting overlay tmpfs")?;
        }
        EphemeralType::Block => {
            let options = vec!["defaults".to_string()];
            rt.mounter
                .mount(
                    &ephemeral.device,
                    &overlay_dir,
                    consts::EPHEMERAL_BLOCK_FSTYPE,
                    &options,
                )
                .with_context(|| format!("Mounting overlay device {}", ephemeral.device))?;
        }
    }

    for path in &ephemeral.paths {
        tracing::debug!("Mounting path {path} into {sysroot}");
        mount_overlay_path(rt, sysroot, &overlay_dir, path)?;
    }
    Ok(())
}

/// Mount the configured persistent paths over the persistent volume. With
/// no persistent volume configured this is a no-op.
#[context("Mounting persistent paths")]
pub fn mount_persistent(
    rt: &Runtime,
    sysroot: &Utf8Path,
    persistent: &PersistentMounts,
    volumes: &[VolumeMount],
) -> Result<()> {
    let Some(vol) = volumes.iter().find(|v| v.persistent) else {
        tracing::debug!("No persistent device defined, omitting persistent paths mounts");
        return Ok(());
    };

    let state_root = vol.mountpoint.join(consts::PERSISTENT_STATE_DIR);
    for path in &persistent.paths {
        tracing::debug!("Mounting path {path} into {sysroot}");
        match persistent.mode {
            PersistentMode::Overlay => mount_overlay_path(rt, sysroot, &state_root, path)?,
            PersistentMode::Bind => mount_bind_path(rt, sysroot, &state_root, path)?,
        }
    }
    Ok(())
}

/// Overlay-mount `path`: the lower is the sysroot's version, upper and
/// work directories live under `workspace`.
#[context("Mounting overlay path {path}")]
fn mount_overlay_path(
    rt: &Runtime,
    sysroot: &Utf8Path,
    workspace: &Utf8Path,
    path: &Utf8Path,
) -> Result<()> {
    let lower = rebase_path(sysroot, path);
    mkdir_all(&lower)?;

    let name = mangle_path(path) + consts::OVERLAY_SUFFIX;
    let upper = workspace.join(&name).join("upper");
    mkdir_all(&upper)?;
    let work = workspace.join(&name).join("work");
    mkdir_all(&work)?;

    tracing::debug!("Mounting overlay {lower}");
    let options = vec![
        "defaults".to_string(),
        format!("lowerdir={lower}"),
        format!("upperdir={upper}"),
        format!("workdir={work}"),
    ];
    rt.mounter.mount("overlay", &lower, "overlay", &options)
}

/// Bind-mount `path`: state is seeded from the sysroot's version into a
/// directory under `workspace`, then bound over it.
#[context("Mounting bind path {path}")]
fn mount_bind_path(
    rt: &Runtime,
    sysroot: &Utf8Path,
    workspace: &Utf8Path,
    path: &Utf8Path,
) -> Result<()> {
    let base = rebase_path(sysroot, path);
    mkdir_all(&base)?;

    let state_dir = workspace.join(mangle_path(path) + consts::BIND_SUFFIX);
    mkdir_all(&state_dir)?;

    sync_data(rt.runner, &base, &state_dir, &[])?;

    let options = vec!["defaults".to_string(), "bind".to_string()];
    rt.mounter
        .mount(state_dir.as_str(), &base, "none", &options)
}

struct FoundMount {
    source: String,
    target: String,
    fstype: String,
    options: Vec<String>,
}

fn findmnt(runner: &dyn Runner, mountpoint: &str) -> Result<Vec<FoundMount>> {
    static BTRFS_SUBVOL: OnceLock<Regex> = OnceLock::new();
    let re = BTRFS_SUBVOL.get_or_init(|| Regex::new(r"(/.+)\[.*\]").unwrap());

    let out = runner.run(
        "findmnt",
        &["-Rrfno", "SOURCE,TARGET,FSTYPE,OPTIONS", mountpoint],
    )?;
    let out = String::from_utf8_lossy(&out);

    let mut mounts = Vec::new();
    for line in out.trim().lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 4 {
            continue;
        }
        let mut source = fields[0].to_string();
        // btrfs sources carry a [subvolume] suffix fstab must not see
        if fields[2] == "btrfs" {
            if let Some(c) = re.captures(&source) {
                source = c[1].to_string();
            }
        }
        mounts.push(FoundMount {
            source,
            target: fields[1].to_string(),
            fstype: fields[2].to_string(),
            options: fields[3].split(',').map(ToString::to_string).collect(),
        });
    }
    Ok(mounts)
}

/// Derive the fstab lines describing the mounts the system already has:
/// the sysroot itself (rewritten to `/`), everything below it (rebased),
/// and the engine's runtime mounts (kept verbatim).
#[context("Collecting initial fstab data")]
pub fn initial_fstab_data(rt: &Runtime, sysroot: &Utf8Path) -> Result<String> {
    let mut data = String::new();
    let sysroot = sysroot.as_str();

    for mnt in findmnt(rt.runner, "/")? {
        if mnt.target == sysroot {
            data += &fstab_line(&mnt.source, "/", &mnt.fstype, &mnt.options);
        } else if let Some(rebased) = mnt.target.strip_prefix(sysroot) {
            data += &fstab_line(&mnt.source, rebased, &mnt.fstype, &mnt.options);
        } else if mnt.target.starts_with(rt.run_root.as_str())
            || mnt.target == consts::RUNNING_STATE_DIR
        {
            data += &fstab_line(&mnt.source, &mnt.target, &mnt.fstype, &mnt.options);
        }
    }
    Ok(data)
}

/// Write `<sysroot>/etc/fstab` describing the layout of `spec`, appended
/// to the already-derived initial lines.
#[context("Writing fstab")]
pub fn write_fstab(rt: &Runtime, spec: &MountSpec, initial: &str) -> Result<()> {
    if !spec.write_fstab {
        tracing::debug!("Skipping writing fstab");
        return Ok(());
    }

    let overlay_dir = rt.overlay_dir();
    let mut data = initial.to_string();
    let tmpfs_opts = vec![
        "defaults".to_string(),
        format!("size={}", spec.ephemeral.size),
    ];
    data += &fstab_line("tmpfs", overlay_dir.as_str(), "tmpfs", &tmpfs_opts);

    let mut persistent_vol = None;
    for vol in &spec.volumes {
        if vol.persistent {
            persistent_vol = Some(vol);
        }
        data += &fstab_line(&vol.device, vol.mountpoint.as_str(), "auto", &vol.options);
    }

    for path in &spec.ephemeral.paths {
        data += &overlay_fstab_line(path, &overlay_dir, &overlay_dir);
    }

    if let Some(vol) = persistent_vol {
        let state_root = vol.mountpoint.join(consts::PERSISTENT_STATE_DIR);
        for path in &spec.persistent.paths {
            match spec.persistent.mode {
                PersistentMode::Overlay => {
                    data += &overlay_fstab_line(path, &state_root, &vol.mountpoint);
                }
                PersistentMode::Bind => {
                    let state_dir = state_root.join(mangle_path(path) + consts::BIND_SUFFIX);
                    let options = vec!["defaults".to_string(), "bind".to_string()];
                    data += &fstab_line(state_dir.as_str(), path.as_str(), "none", &options);
                }
            }
        }
    }

    let etc = spec.sysroot.join("etc");
    mkdir_all(&etc)?;
    let fstab = etc.join("fstab");
    std::fs::write(&fstab, data).with_context(|| format!("Writing {fstab}"))?;
    std::fs::set_permissions(
        &fstab,
        std::fs::Permissions::from_mode(consts::FILE_PERM),
    )?;
    Ok(())
}

fn fstab_line(device: &str, path: &str, fstype: &str, options: &[String]) -> String {
    let options = if options.is_empty() {
        "defaults".to_string()
    } else {
        options.join(",")
    };
    format!("{device}\t{path}\t{fstype}\t{options}\t0\t0\n")
}

/// The fstab rendition of an overlay path: targets and lowerdir are in the
/// booted filesystem's view, and the line waits for its workspace mount.
fn overlay_fstab_line(path: &Utf8Path, workspace: &Utf8Path, required_mount: &Utf8Path) -> String {
    let name = mangle_path(path) + consts::OVERLAY_SUFFIX;
    let options = vec![
        "defaults".to_string(),
        format!("lowerdir={path}"),
        format!("upperdir={}", workspace.join(&name).join("upper")),
        format!("workdir={}", workspace.join(&name).join("work")),
        format!("x-systemd.requires-mounts-for={required_mount}"),
    ];
    fstab_line("overlay", path.as_str(), "overlay", &options)
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use crate::mounter::Mounter;
    use crate::testing::{FakeMounter, FakeRunner};

    use super::*;

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let t = tempfile::tempdir().unwrap();
        let p = Utf8PathBuf::from_path_buf(t.path().to_path_buf()).unwrap();
        (t, p)
    }

    #[test]
    fn test_mangle_path() {
        assert_eq!(mangle_path(Utf8Path::new("/var/log")), "var-log");
        assert_eq!(mangle_path(Utf8Path::new("/etc/ssh")), "etc-ssh");
        assert_eq!(mangle_path(Utf8Path::new("/home")), "home");
    }

    #[test]
    fn test_resolve_device_reference() {
        let cases = [
            ("LABEL=STATE", "/dev/disk/by-label/STATE"),
            ("PARTLABEL=oem", "/dev/disk/by-partlabel/oem"),
            ("UUID=abc", "/dev/disk/by-uuid/abc"),
            ("/dev/vda2", "/dev/vda2"),
        ];
        for (input, expected) in cases {
            assert_eq!(resolve_device_reference(input).unwrap(), expected);
        }
        for bogus in ["BOGUS=1", "vda2", "label=state", ""] {
            assert!(resolve_device_reference(bogus).is_err(), "{bogus}");
        }
    }

    #[test]
    fn test_mount_volumes_aggregates_failures() {
        let (_t, dir) = tempdir();
        let runner = FakeRunner::new();
        let mounter = FakeMounter::new();
        let rt = Runtime::new(&runner, &mounter);
        let sysroot = dir.join("sysroot");

        let volumes = vec![
            VolumeMount {
                device: "BOGUS=1".into(),
                mountpoint: "/mnt/bogus".into(),
                ..Default::default()
            },
            VolumeMount {
                device: "UUID=abc".into(),
                mountpoint: "/usr/local".into(),
                options: vec!["rw".into()],
                ..Default::default()
            },
        ];

        let err = mount_volumes(&rt, &sysroot, &volumes).unwrap_err();
        assert!(format!("{err}").contains("unknown device reference"));

        // The valid volume was still mounted
        let entry = mounter.entry_for(&sysroot.join("usr/local")).unwrap();
        assert_eq!(entry.source, "/dev/disk/by-uuid/abc");
        assert_eq!(entry.fstype, "auto");
        assert_eq!(entry.options, vec!["rw".to_string()]);
        assert_eq!(mounter.mount_count(), 1);
    }

    #[test]
    fn test_rebase_path() {
        let sysroot = Utf8Path::new("/sysroot");
        assert_eq!(rebase_path(sysroot, Utf8Path::new("/var/log")), "/sysroot/var/log");
        assert_eq!(rebase_path(sysroot, Utf8Path::new("/home")), "/sysroot/home");
        // /run always names the running system
        assert_eq!(
            rebase_path(sysroot, Utf8Path::new("/run/elemental/persistent")),
            "/run/elemental/persistent"
        );
    }

    #[test]
    fn test_mount_ephemeral_overlay_layout() {
        let (_t, dir) = tempdir();
        let runner = FakeRunner::new();
        let mounter = FakeMounter::new();
        let mut rt = Runtime::new(&runner, &mounter);
        rt.run_root = dir.join("run/elemental");
        let sysroot = dir.join("sysroot");

        let ephemeral = EphemeralMounts {
            kind: EphemeralType::Tmpfs,
            size: "2G".into(),
            device: String::new(),
            paths: vec!["/var/log".into()],
        };
        mount_ephemeral(&rt, &sysroot, &ephemeral).unwrap();

        let overlay_dir = rt.overlay_dir();
        let ws = mounter.entry_for(&overlay_dir).unwrap();
        assert_eq!(ws.source, "tmpfs");
        assert_eq!(ws.fstype, "tmpfs");
        assert_eq!(
            ws.options,
            vec!["defaults".to_string(), "size=2G".to_string()]
        );

        let lower = sysroot.join("var/log");
        let entry = mounter.entry_for(&lower).unwrap();
        assert_eq!(entry.source, "overlay");
        assert_eq!(entry.fstype, "overlay");
        let upper = overlay_dir.join("var-log.overlay/upper");
        let work = overlay_dir.join("var-log.overlay/work");
        assert!(entry.options.contains(&format!("lowerdir={lower}")));
        assert!(entry.options.contains(&format!("upperdir={upper}")));
        assert!(entry.options.contains(&format!("workdir={work}")));
        assert!(upper.is_dir());
        assert!(work.is_dir());
    }

    #[test]
    fn test_mount_ephemeral_block_device() {
        let (_t, dir) = tempdir();
        let runner = FakeRunner::new();
        let mounter = FakeMounter::new();
        let mut rt = Runtime::new(&runner, &mounter);
        rt.run_root = dir.join("run/elemental");

        let ephemeral = EphemeralMounts {
            kind: EphemeralType::Block,
            size: String::new(),
            device: "/dev/vda4".into(),
            paths: vec![],
        };
        mount_ephemeral(&rt, &dir.join("sysroot"), &ephemeral).unwrap();
        let ws = mounter.entry_for(&rt.overlay_dir()).unwrap();
        assert_eq!(ws.source, "/dev/vda4");
        assert_eq!(ws.fstype, "autofs");
    }

    #[test]
    fn test_mount_persistent_bind_seeds_state() {
        let (_t, dir) = tempdir();
        let runner = FakeRunner::new();
        let mounter = FakeMounter::new();
        let rt = Runtime::new(&runner, &mounter);
        let sysroot = dir.join("sysroot");

        // Pre-existing content below the sysroot that must survive
        std::fs::create_dir_all(sysroot.join("etc/ssh").as_std_path()).unwrap();
        std::fs::write(
            sysroot.join("etc/ssh/sshd_config").as_std_path(),
            "Port 22\n",
        )
        .unwrap();

        let volumes = vec![VolumeMount {
            device: "LABEL=PERSISTENT".into(),
            mountpoint: dir.join("persistent"),
            persistent: true,
            ..Default::default()
        }];
        let persistent = PersistentMounts {
            mode: PersistentMode::Bind,
            paths: vec!["/etc/ssh".into()],
        };
        mount_persistent(&rt, &sysroot, &persistent, &volumes).unwrap();

        let state_dir = dir.join("persistent/.state/etc-ssh.bind");
        assert!(state_dir.is_dir());
        // Seeding goes through rsync
        let seed_src = format!("{}/", sysroot.join("etc/ssh"));
        assert!(runner.called_with("rsync", &[seed_src.as_str(), state_dir.as_str()]));
        // And the state is bind mounted back over the lower path
        let entry = mounter.entry_for(&sysroot.join("etc/ssh")).unwrap();
        assert_eq!(entry.source, state_dir.as_str());
        assert_eq!(entry.fstype, "none");
        assert_eq!(
            entry.options,
            vec!["defaults".to_string(), "bind".to_string()]
        );
    }

    #[test]
    fn test_mount_persistent_without_volume_is_noop() {
        let (_t, dir) = tempdir();
        let runner = FakeRunner::new();
        let mounter = FakeMounter::new();
        let rt = Runtime::new(&runner, &mounter);

        let persistent = PersistentMounts {
            mode: PersistentMode::Overlay,
            paths: vec!["/home".into()],
        };
        mount_persistent(&rt, &dir.join("sysroot"), &persistent, &[]).unwrap();
        assert_eq!(mounter.mount_count(), 0);
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_initial_fstab_data_rules() {
        let runner = FakeRunner::new();
        let mounter = FakeMounter::new();
        let rt = Runtime::new(&runner, &mounter);
        let sysroot = "/sysroot";

        runner.set_side_effect(move |cmd, _| {
            assert_eq!(cmd, "findmnt");
            Ok(b"/dev/vda3 /sysroot ext4 rw,relatime\n\
                 /dev/vda3[/@/var] /sysroot/var btrfs rw,subvol=/@/var\n\
                 /dev/vda5 /run/elemental/persistent ext4 rw\n\
                 /dev/vda3 /run/initramfs/elemental-state ext4 ro\n\
                 tmpfs /run tmpfs rw\n\
                 garbage-line\n"
                .to_vec())
        });

        let data = initial_fstab_data(&rt, Utf8Path::new(sysroot)).unwrap();
        let lines: Vec<&str> = data.lines().collect();
        assert_eq!(
            lines,
            vec![
                "/dev/vda3\t/\text4\trw,relatime\t0\t0",
                // btrfs subvolume suffix is stripped from SOURCE only
                "/dev/vda3\t/var\tbtrfs\trw,subvol=/@/var\t0\t0",
                "/dev/vda5\t/run/elemental/persistent\text4\trw\t0\t0",
                "/dev/vda3\t/run/initramfs/elemental-state\text4\tro\t0\t0",
            ]
        );
    }

    #[test]
    fn test_write_fstab_minimal() {
        let (_t, dir) = tempdir();
        let runner = FakeRunner::new();
        let mounter = FakeMounter::new();
        let rt = Runtime::new(&runner, &mounter);
        let sysroot = dir.join("sysroot");

        runner.set_side_effect({
            let sysroot = sysroot.clone();
            move |_, _| Ok(format!("/dev/loop0 {sysroot} ext2 ro,relatime\n").into_bytes())
        });

        let spec = MountSpec {
            sysroot: sysroot.clone(),
            write_fstab: true,
            ephemeral: EphemeralMounts {
                size: "30%".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        let initial = initial_fstab_data(&rt, &sysroot).unwrap();
        write_fstab(&rt, &spec, &initial).unwrap();

        let fstab = std::fs::read_to_string(sysroot.join("etc/fstab").as_std_path()).unwrap();
        assert_eq!(
            fstab,
            "/dev/loop0\t/\text2\tro,relatime\t0\t0\n\
             tmpfs\t/run/elemental/overlay\ttmpfs\tdefaults,size=30%\t0\t0\n"
        );
    }

    #[test]
    fn test_write_fstab_full_layout() {
        let (_t, dir) = tempdir();
        let runner = FakeRunner::new();
        let mounter = FakeMounter::new();
        let rt = Runtime::new(&runner, &mounter);
        let sysroot = dir.join("sysroot");

        let spec = MountSpec {
            sysroot: sysroot.clone(),
            write_fstab: true,
            volumes: vec![
                VolumeMount {
                    device: "UUID=abc".into(),
                    mountpoint: "/usr/local".into(),
                    options: vec!["rw".into(), "noatime".into()],
                    persistent: false,
                },
                VolumeMount {
                    device: "LABEL=PERSISTENT".into(),
                    mountpoint: "/run/elemental/persistent".into(),
                    options: vec![],
                    persistent: true,
                },
            ],
            ephemeral: EphemeralMounts {
                size: "30%".into(),
                paths: vec!["/var/log".into()],
                ..Default::default()
            },
            persistent: PersistentMounts {
                mode: PersistentMode::Bind,
                paths: vec!["/etc/ssh".into()],
            },
        };
        write_fstab(&rt, &spec, "").unwrap();

        let fstab = std::fs::read_to_string(sysroot.join("etc/fstab").as_std_path()).unwrap();
        let lines: Vec<&str> = fstab.lines().collect();
        assert_eq!(
            lines,
            vec![
                "tmpfs\t/run/elemental/overlay\ttmpfs\tdefaults,size=30%\t0\t0",
                "UUID=abc\t/usr/local\tauto\trw,noatime\t0\t0",
                "LABEL=PERSISTENT\t/run/elemental/persistent\tauto\tdefaults\t0\t0",
                "overlay\t/var/log\toverlay\tdefaults,lowerdir=/var/log,\
                 upperdir=/run/elemental/overlay/var-log.overlay/upper,\
                 workdir=/run/elemental/overlay/var-log.overlay/work,\
                 x-systemd.requires-mounts-for=/run/elemental/overlay\t0\t0",
                "/run/elemental/persistent/.state/etc-ssh.bind\t/etc/ssh\tnone\tdefaults,bind\t0\t0",
            ]
        );
        // Targets are unique
        let mut targets: Vec<&str> = lines.iter().map(|l| l.split('\t').nth(1).unwrap()).collect();
        targets.sort();
        targets.dedup();
        assert_eq!(targets.len(), lines.len());
    }

    #[test]
    fn test_write_fstab_persistent_overlay_mode() {
        let (_t, dir) = tempdir();
        let runner = FakeRunner::new();
        let mounter = FakeMounter::new();
        let rt = Runtime::new(&runner, &mounter);
        let sysroot = dir.join("sysroot");

        let spec = MountSpec {
            sysroot: sysroot.clone(),
            write_fstab: true,
            volumes: vec![VolumeMount {
                device: "LABEL=PERSISTENT".into(),
                mountpoint: "/run/elemental/persistent".into(),
                options: vec![],
                persistent: true,
            }],
            persistent: PersistentMounts {
                mode: PersistentMode::Overlay,
                paths: vec!["/home".into()],
            },
            ..Default::default()
        };
        write_fstab(&rt, &spec, "").unwrap();

        let fstab = std::fs::read_to_string(sysroot.join("etc/fstab").as_std_path()).unwrap();
        let overlay_line = fstab
            .lines()
            .find(|l| l.starts_with("overlay\t/home"))
            .unwrap();
        assert!(overlay_line
            .contains("upperdir=/run/elemental/persistent/.state/home.overlay/upper"));
        assert!(overlay_line
            .contains("x-systemd.requires-mounts-for=/run/elemental/persistent"));
    }

    #[test]
    fn test_run_mount_end_to_end() {
        let (_t, dir) = tempdir();
        let runner = FakeRunner::new();
        let mounter = FakeMounter::new();
        let mut rt = Runtime::new(&runner, &mounter);
        rt.run_root = dir.join("run/elemental");
        let sysroot = dir.join("sysroot");

        runner.set_side_effect({
            let sysroot = sysroot.clone();
            move |cmd, _| match cmd {
                "findmnt" => Ok(format!("/dev/vda2 {sysroot} ext4 ro\n").into_bytes()),
                _ => Ok(Vec::new()),
            }
        });

        let spec = MountSpec {
            sysroot: sysroot.clone(),
            write_fstab: true,
            volumes: vec![VolumeMount {
                device: "UUID=abc".into(),
                mountpoint: "/usr/local".into(),
                options: vec![],
                persistent: false,
            }],
            ephemeral: EphemeralMounts {
                size: "30%".into(),
                paths: vec!["/var/log".into()],
                ..Default::default()
            },
            ..Default::default()
        };
        run_mount(&rt, &spec).unwrap();

        // volume + overlay workspace + overlay path
        assert_eq!(mounter.mount_count(), 3);
        assert!(mounter.is_mounted(&sysroot.join("usr/local")).unwrap());
        assert!(mounter.is_mounted(&rt.overlay_dir()).unwrap());
        assert!(mounter.is_mounted(&sysroot.join("var/log")).unwrap());

        let fstab = std::fs::read_to_string(sysroot.join("etc/fstab").as_std_path()).unwrap();
        // one line per volume, ephemeral path, tmpfs workspace and the
        // derived initial block
        assert_eq!(fstab.lines().count(), 4);
        assert!(fstab.starts_with("/dev/vda2\t/\text4\tro\t0\t0\n"));
    }

    #[test]
    fn test_run_mount_rejects_two_persistent_volumes() {
        let (_t, dir) = tempdir();
        let runner = FakeRunner::new();
        let mounter = FakeMounter::new();
        let rt = Runtime::new(&runner, &mounter);

        let vol = VolumeMount {
            device: "LABEL=PERSISTENT".into(),
            mountpoint: "/run/elemental/persistent".into(),
            persistent: true,
            ..Default::default()
        };
        let spec = MountSpec {
            sysroot: dir.join("sysroot"),
            volumes: vec![vol.clone(), vol],
            ..Default::default()
        };
        assert!(run_mount(&rt, &spec).is_err());
        assert_eq!(mounter.mount_count(), 0);
    }
}
