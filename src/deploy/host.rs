//! Execution substrates for the deployment sequence.
//!
//! The orchestrator only ever talks to a `ServiceHost`: run a shell string, write a file with
//! elevated privileges, ask the service manager about a unit. One implementation drives the
//! local machine, one drives the Lima VM over `limactl shell`.
use anyhow::{anyhow, Result};

use crate::util::{shell_escape, Cmd, CommandRunner, ExecOutput};
use crate::vm::LimaVm;

pub trait ServiceHost {
    /// Human label for progress lines ("host", "Lima VM 'x'").
    fn describe(&self) -> String;

    /// Run `script` with `sh -c` semantics, capturing output. Exit status is not checked.
    fn run(&self, script: &str) -> Result<ExecOutput>;

    /// Run `script` with output streamed to the terminal; non-zero exit is an error.
    fn run_checked(&self, script: &str) -> Result<()>;

    /// Write `content` to `path` as root, optionally chmod-ing it.
    fn write_privileged(&self, path: &str, content: &str, mode: Option<u32>) -> Result<()>;

    /// Command prefix for privileged scripts ("sudo " or "" when already root).
    fn sudo(&self) -> &str;

    /// `systemctl is-active <unit>` output ("active", "inactive", "failed", ...).
    fn unit_state(&self, unit: &str) -> Result<String> {
        let out = self.run(&format!("systemctl is-active {}", shell_escape(unit)))?;
        let state = out.stdout_trimmed();
        Ok(if state.is_empty() {
            "unknown".to_string()
        } else {
            state.to_string()
        })
    }
}

fn privileged_prefix() -> &'static str {
    if nix::unistd::geteuid().is_root() {
        ""
    } else {
        "sudo "
    }
}

fn tee_script(sudo: &str, path: &str, mode: Option<u32>) -> String {
    let dir = std::path::Path::new(path)
        .parent()
        .map(|p| p.display().to_string())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "/".to_string());
    let mut s = format!(
        "{sudo}mkdir -p {} && {sudo}tee {} >/dev/null",
        shell_escape(&dir),
        shell_escape(path)
    );
    if let Some(m) = mode {
        s.push_str(&format!(" && {sudo}chmod {:o} {}", m, shell_escape(path)));
    }
    s
}

/// The machine devctl runs on.
#[derive(Debug, Clone)]
pub struct LocalHost {
    runner: CommandRunner,
    sudo: &'static str,
}

impl LocalHost {
    pub fn new() -> Self {
        Self {
            runner: CommandRunner::new(),
            sudo: privileged_prefix(),
        }
    }
}

impl Default for LocalHost {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceHost for LocalHost {
    fn describe(&self) -> String {
        "host".to_string()
    }

    fn run(&self, script: &str) -> Result<ExecOutput> {
        self.runner
            .run(Cmd::new("sh").args(["-c", script]).capture_output(true))
    }

    fn run_checked(&self, script: &str) -> Result<()> {
        self.runner.run_checked(Cmd::new("sh").args(["-c", script]))?;
        Ok(())
    }

    fn write_privileged(&self, path: &str, content: &str, mode: Option<u32>) -> Result<()> {
        let out = self.runner.run(
            Cmd::new("sh")
                .args(["-c", &tee_script(self.sudo, path, mode)])
                .stdin_bytes(content.as_bytes().to_vec())
                .capture_output(true),
        )?;
        if !out.status.success() {
            return Err(anyhow!("failed to write {path}: {}", out.stderr.trim()));
        }
        Ok(())
    }

    fn sudo(&self) -> &str {
        self.sudo
    }
}

/// systemd inside the Lima VM; every script runs through a login bash in the VM.
#[derive(Debug, Clone)]
pub struct VmHost {
    vm: LimaVm,
}

impl VmHost {
    pub fn new(vm: LimaVm) -> Self {
        Self { vm }
    }

    pub fn vm(&self) -> &LimaVm {
        &self.vm
    }
}

impl ServiceHost for VmHost {
    fn describe(&self) -> String {
        format!("Lima VM '{}'", self.vm.name)
    }

    fn run(&self, script: &str) -> Result<ExecOutput> {
        self.vm.run(self.vm.bash(script).capture_output(true))
    }

    fn run_checked(&self, script: &str) -> Result<()> {
        self.vm.run_checked(self.vm.bash(script))?;
        Ok(())
    }

    fn write_privileged(&self, path: &str, content: &str, mode: Option<u32>) -> Result<()> {
        let out = self.vm.run(
            self.vm
                .bash(&tee_script("sudo ", path, mode))
                .stdin_bytes(content.as_bytes().to_vec())
                .capture_output(true),
        )?;
        if !out.status.success() {
            return Err(anyhow!(
                "failed to write {path} in Lima VM '{}': {}",
                self.vm.name,
                out.stderr.trim()
            ));
        }
        Ok(())
    }

    fn sudo(&self) -> &str {
        "sudo "
    }
}
