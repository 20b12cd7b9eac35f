//! Lima VM control: the isolated execution environment used on hosts without systemd.
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::util::{Cmd, CommandRunner, ExecOutput};

pub const LIMACTL: &str = "limactl";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmStatus {
    Running,
    /// Exists but is not running (Stopped, Broken, ...).
    Stopped(String),
    Missing,
    /// `limactl` itself is not installed or not usable.
    NoTool,
}

#[derive(Debug, Deserialize)]
struct ListEntry {
    name: String,
    #[serde(default)]
    status: String,
}

/// Parse `limactl list --json` output: one JSON object per line; junk lines are skipped.
pub fn parse_list(stdout: &str, name: &str) -> VmStatus {
    for line in stdout.lines() {
        let Ok(entry) = serde_json::from_str::<ListEntry>(line.trim()) else {
            continue;
        };
        if entry.name == name {
            return if entry.status == "Running" {
                VmStatus::Running
            } else {
                VmStatus::Stopped(entry.status)
            };
        }
    }
    VmStatus::Missing
}

#[derive(Debug, Clone)]
pub struct LimaVm {
    pub name: String,
    runner: CommandRunner,
}

impl LimaVm {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            runner: CommandRunner::new(),
        }
    }

    pub fn tool_available() -> bool {
        which::which(LIMACTL).is_ok()
    }

    /// Read-only status query.
    pub fn status(&self) -> VmStatus {
        if !Self::tool_available() {
            return VmStatus::NoTool;
        }
        match self
            .runner
            .run(Cmd::new(LIMACTL).args(["list", "--json"]).capture_output(true))
        {
            Ok(out) if out.status.success() => parse_list(&out.stdout, &self.name),
            Ok(_) => VmStatus::Missing,
            Err(e) => {
                tracing::debug!(error = %e, "limactl list failed");
                VmStatus::NoTool
            }
        }
    }

    pub fn start(&self) -> Result<()> {
        self.runner
            .run_checked(Cmd::new(LIMACTL).args(["start", self.name.as_str()]))?;
        Ok(())
    }

    /// Start the VM if it exists but is stopped. Errors if it does not exist.
    pub fn ensure_running(&self) -> Result<()> {
        match self.status() {
            VmStatus::Running => Ok(()),
            VmStatus::Stopped(state) => {
                tracing::info!(vm = %self.name, %state, "starting Lima VM");
                self.start()
            }
            VmStatus::Missing | VmStatus::NoTool => Err(crate::DevError::prerequisite(
                format!("Lima VM '{}' does not exist.", self.name),
                &["Create it with: devctl vm create"],
            )
            .into()),
        }
    }

    pub fn create(&self, template: &Path) -> Result<()> {
        self.runner.run_checked(
            Cmd::new(LIMACTL)
                .arg("create")
                .arg(format!("--name={}", self.name))
                .arg(template),
        )?;
        Ok(())
    }

    pub fn delete(&self) -> Result<()> {
        self.runner.run_checked(
            Cmd::new(LIMACTL).args(["delete", self.name.as_str(), "--force"]),
        )?;
        Ok(())
    }

    /// `limactl shell` prefix running `argv` inside the VM from `/`.
    pub fn shell_cmd<I, S>(&self, argv: I) -> Cmd
    where
        I: IntoIterator<Item = S>,
        S: Into<std::ffi::OsString>,
    {
        Cmd::new(LIMACTL)
            .args(["shell", "--workdir", "/", self.name.as_str(), "--"])
            .args(argv)
    }

    /// Run a shell string through a login bash so the VM user's toolchain PATH applies.
    pub fn bash(&self, script: &str) -> Cmd {
        self.shell_cmd(["bash", "-lc", script])
    }

    pub fn run(&self, cmd: Cmd) -> Result<ExecOutput> {
        self.runner.run(cmd)
    }

    pub fn run_checked(&self, cmd: Cmd) -> Result<ExecOutput> {
        self.runner
            .run_checked(cmd)
            .with_context(|| format!("in Lima VM '{}'", self.name))
    }
}
