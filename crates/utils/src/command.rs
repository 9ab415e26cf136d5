use std::io::Read;
use std::process::{Command, Stdio};

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;

use crate::PathQuotedDisplay;

/// Maximum number of stderr lines carried into an error message.
const MAX_STDERR_LINES: usize = 10;

/// Render a command as a single shell-quoted line for diagnostics.
pub(crate) fn command_display(cmd: &Command) -> String {
    let mut s = PathQuotedDisplay::new(cmd.get_program()).to_string();
    for arg in cmd.get_args() {
        s.push(' ');
        s.push_str(&PathQuotedDisplay::new(arg).to_string());
    }
    s
}

fn describe_failure(cmd: &Command, status: &std::process::ExitStatus, stderr: &[u8]) -> anyhow::Error {
    let stderr = String::from_utf8_lossy(stderr);
    let mut lines = stderr.lines().filter(|l| !l.trim().is_empty());
    let mut tail = lines
        .by_ref()
        .take(MAX_STDERR_LINES)
        .collect::<Vec<_>>()
        .join("\n  ");
    if lines.next().is_some() {
        tail.push_str("\n  [...]");
    }
    let name = PathQuotedDisplay::new(cmd.get_program());
    if tail.is_empty() {
        anyhow!("Subprocess {name} failed: {status}")
    } else {
        anyhow!("Subprocess {name} failed: {status}\n  {tail}")
    }
}

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the full command line that is about to run.
    fn log_debug(&mut self) -> &mut Self;

    /// Synchronously execute the child, and return an error if the child
    /// exited unsuccessfully. The error carries the trailing lines of
    /// stderr.
    fn run_capture_stderr(&mut self) -> Result<()>;

    /// Execute the child, returning its stdout on success. Stderr is
    /// captured and folded into the error on failure.
    fn run_get_output(&mut self) -> Result<Vec<u8>>;

    /// Like [`Self::run_get_output`], but decodes stdout as UTF-8.
    fn run_get_string(&mut self) -> Result<String>;

    /// Execute the child, parsing its stdout as JSON.
    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T>;
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {}", command_display(self));
        self
    }

    fn run_capture_stderr(&mut self) -> Result<()> {
        self.run_get_output().map(|_| ())
    }

    fn run_get_output(&mut self) -> Result<Vec<u8>> {
        self.stdin(Stdio::null());
        self.stdout(Stdio::piped());
        self.stderr(Stdio::piped());
        let mut child = self
            .spawn()
            .with_context(|| format!("Spawning {}", command_display(self)))?;
        // SAFETY: we configured piped stdout/stderr above
        let mut stdout = Vec::new();
        child.stdout.take().unwrap().read_to_end(&mut stdout)?;
        let mut stderr = Vec::new();
        child.stderr.take().unwrap().read_to_end(&mut stderr)?;
        let status = child.wait()?;
        if !status.success() {
            return Err(describe_failure(self, &status, &stderr));
        }
        Ok(stdout)
    }

    fn run_get_string(&mut self) -> Result<String> {
        let out = self.run_get_output()?;
        String::from_utf8(out).map_err(|_| {
            anyhow!(
                "Subprocess {} emitted invalid UTF-8",
                PathQuotedDisplay::new(self.get_program())
            )
        })
    }

    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let out = self.run_get_output()?;
        serde_json::from_slice(&out).with_context(|| {
            format!(
                "Parsing JSON output of {}",
                PathQuotedDisplay::new(self.get_program())
            )
        })
    }
}
