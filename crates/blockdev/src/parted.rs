use anyhow::{anyhow, bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use elemental_utils::Runner;

use crate::list_device;

/// A partition as reported by `parted --machine ... unit MiB print`.
#[derive(Debug, Clone, PartialEq)]
pub struct PartedPartition {
    pub number: u32,
    pub start_mib: f64,
    pub end_mib: f64,
    pub size_mib: f64,
    pub fstype: String,
    pub name: String,
    pub flags: Vec<String>,
}

/// The decoded partition table of a disk.
#[derive(Debug, Clone, PartialEq)]
pub struct DiskLayout {
    pub table: String,
    pub size_mib: f64,
    pub partitions: Vec<PartedPartition>,
}

impl DiskLayout {
    pub fn last_partition(&self) -> Option<&PartedPartition> {
        self.partitions.last()
    }
}

fn parse_mib(s: &str) -> Result<f64> {
    s.trim_end_matches("MiB")
        .parse()
        .with_context(|| format!("Parsing MiB value {s:?}"))
}

/// Decode the machine-readable output of `parted unit MiB print`.
pub fn parse_print_output(out: &str) -> Result<DiskLayout> {
    let mut lines = out
        .lines()
        .map(|l| l.trim().trim_end_matches(';'))
        .filter(|l| !l.is_empty() && *l != "BYT");
    let disk = lines.next().ok_or_else(|| anyhow!("empty parted output"))?;
    let fields: Vec<&str> = disk.split(':').collect();
    if fields.len() < 6 {
        bail!("malformed parted disk line: {disk:?}");
    }
    let size_mib = parse_mib(fields[1])?;
    let table = fields[5].to_string();

    let mut partitions = Vec::new();
    for line in lines {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 7 {
            bail!("malformed parted partition line: {line:?}");
        }
        partitions.push(PartedPartition {
            number: fields[0]
                .parse()
                .with_context(|| format!("Parsing partition number {:?}", fields[0]))?,
            start_mib: parse_mib(fields[1])?,
            end_mib: parse_mib(fields[2])?,
            size_mib: parse_mib(fields[3])?,
            fstype: fields[4].to_string(),
            name: fields[5].to_string(),
            flags: fields[6]
                .split(',')
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
                .collect(),
        });
    }
    Ok(DiskLayout {
        table,
        size_mib,
        partitions,
    })
}

/// Handle for manipulating the partition table of one disk through
/// parted(8).
pub struct Disk<'a> {
    device: Utf8PathBuf,
    runner: &'a dyn Runner,
}

impl<'a> Disk<'a> {
    pub fn new(device: impl Into<Utf8PathBuf>, runner: &'a dyn Runner) -> Self {
        Self {
            device: device.into(),
            runner,
        }
    }

    pub fn device(&self) -> &Utf8Path {
        &self.device
    }

    /// Whether the device node is present.
    pub fn exists(&self) -> bool {
        self.device.as_std_path().exists()
    }

    fn parted(&self, args: &[&str]) -> Result<Vec<u8>> {
        let mut all = vec!["--script", "--machine", "--", self.device.as_str()];
        all.extend_from_slice(args);
        self.runner.run("parted", &all)
    }

    /// Wipe the disk and start a fresh partition table (`gpt` or `msdos`).
    #[context("Creating {label} partition table on {}", self.device)]
    pub fn new_partition_table(&self, label: &str) -> Result<()> {
        self.parted(&["mklabel", label])?;
        Ok(())
    }

    /// Read the current layout.
    pub fn print(&self) -> Result<DiskLayout> {
        let out = self.parted(&["unit", "MiB", "print"])?;
        parse_print_output(&String::from_utf8_lossy(&out))
    }

    /// Append a partition of `size_mib` MiB (0 consumes the remainder of
    /// the disk), returning its partition number. Allocation is MiB
    /// aligned, starting right after the last existing partition.
    #[context("Adding partition {name} to {}", self.device)]
    pub fn add_partition(
        &self,
        size_mib: u64,
        fstype: &str,
        name: &str,
        flags: &[String],
    ) -> Result<u32> {
        let layout = self.print()?;
        let (start, number) = match layout.last_partition() {
            Some(p) => (p.end_mib.ceil() as u64, p.number + 1),
            None => (1, 1),
        };
        let end = if size_mib == 0 {
            "100%".to_string()
        } else {
            format!("{}MiB", start + size_mib)
        };
        let start = format!("{start}MiB");
        let name = if name.is_empty() { "primary" } else { name };

        let mut args = vec!["unit", "MiB", "mkpart", name];
        let mkpart_fs = match fstype {
            "vfat" => "fat32",
            other => other,
        };
        if !mkpart_fs.is_empty() {
            args.push(mkpart_fs);
        }
        args.push(&start);
        args.push(&end);
        let number_str = number.to_string();
        for flag in flags {
            args.extend_from_slice(&["set", number_str.as_str(), flag.as_str(), "on"]);
        }
        self.parted(&args)?;
        Ok(number)
    }

    /// Resolve the device node of partition `number`, letting udev settle
    /// first so freshly created nodes had a chance to appear.
    #[context("Resolving partition {number} of {}", self.device)]
    pub fn find_partition_device(&self, number: u32) -> Result<Utf8PathBuf> {
        if self.runner.command_exists("udevadm") {
            let _ = self.runner.run("udevadm", &["settle"]);
        }
        let dev = list_device(self.runner, &self.device)?;
        let children = dev.children.unwrap_or_default();
        let part = children
            .into_iter()
            .nth(number as usize - 1)
            .ok_or_else(|| anyhow!("partition {number} not listed under {}", self.device))?;
        Ok(Utf8PathBuf::from(part.path()))
    }

    /// Clear all filesystem signatures from a partition.
    pub fn wipe_fs_on_partition(&self, dev: &Utf8Path) -> Result<()> {
        self.runner.run("wipefs", &["--all", dev.as_str()])?;
        Ok(())
    }
}

/// Format `dev` with the given filesystem and label. An empty filesystem
/// wipes existing signatures instead.
#[context("Formatting {dev} as {fstype:?}")]
pub fn format_device(
    runner: &dyn Runner,
    dev: &Utf8Path,
    fstype: &str,
    label: &str,
    extra_opts: &[&str],
) -> Result<()> {
    let (cmd, label_flag) = match fstype {
        "ext2" | "ext3" | "ext4" => (format!("mkfs.{fstype}"), "-L"),
        "vfat" | "fat32" => ("mkfs.vfat".to_string(), "-n"),
        "btrfs" => ("mkfs.btrfs".to_string(), "-L"),
        "" => {
            runner.run("wipefs", &["--all", dev.as_str()])?;
            return Ok(());
        }
        other => bail!("unsupported filesystem: {other}"),
    };
    let mut args = Vec::new();
    if !label.is_empty() {
        args.extend_from_slice(&[label_flag, label]);
    }
    args.extend_from_slice(extra_opts);
    args.push(dev.as_str());
    runner.run(&cmd, &args)?;
    Ok(())
}
