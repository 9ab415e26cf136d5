use std::path::Path;
use std::process::Command;

use anyhow::Result;

use crate::CommandRunExt;

/// Capability object for spawning host utilities. Every external tool the
/// engine touches (mkfs, parted, rsync, losetup, ...) is reached through
/// this trait so that tests can record and stub the invocations.
pub trait Runner {
    /// Run `cmd` with `args`, returning its stdout. A non-zero exit status
    /// is an error carrying the stderr tail.
    fn run(&self, cmd: &str, args: &[&str]) -> Result<Vec<u8>>;

    /// Whether `cmd` resolves to an executable on PATH.
    fn command_exists(&self, cmd: &str) -> bool;
}

impl<'a> dyn Runner + 'a {
    /// Run a command and decode its stdout as trimmed UTF-8.
    pub fn run_get_string(&self, cmd: &str, args: &[&str]) -> Result<String> {
        let out = self.run(cmd, args)?;
        Ok(String::from_utf8_lossy(&out).trim().to_string())
    }
}

/// [`Runner`] implementation that spawns processes on the host.
#[derive(Debug, Default)]
pub struct HostRunner;

impl Runner for HostRunner {
    fn run(&self, cmd: &str, args: &[&str]) -> Result<Vec<u8>> {
        Command::new(cmd).args(args).log_debug().run_get_output()
    }

    fn command_exists(&self, cmd: &str) -> bool {
        if cmd.contains('/') {
            return Path::new(cmd).exists();
        }
        let Some(path) = std::env::var_os("PATH") else {
            return false;
        };
        std::env::split_paths(&path).any(|d| d.join(cmd).is_file())
    }
}
