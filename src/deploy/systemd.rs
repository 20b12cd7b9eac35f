//! Install-and-activate for socket-activated units, shared by the native and isolated targets.
use std::thread;
use std::time::Duration;

use anyhow::Result;

use super::host::ServiceHost;
use super::{Activation, Artifact, StatusLine};
use crate::units::{self, UnitConfig};
use crate::util::{shell_escape, tail_lines};
use crate::DevError;

pub const UNIT_DIR: &str = "/etc/systemd/system";

/// Waits applied after activation before the unit is expected to be active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyBudget {
    pub settle: Duration,
    pub attempts: u32,
    pub interval: Duration,
}

impl VerifyBudget {
    pub fn from_secs(settle_secs: u64) -> Self {
        Self {
            settle: Duration::from_secs(settle_secs),
            attempts: 5,
            interval: Duration::from_secs(1),
        }
    }

    pub const IMMEDIATE: VerifyBudget = VerifyBudget {
        settle: Duration::ZERO,
        attempts: 1,
        interval: Duration::ZERO,
    };
}

pub struct SystemdInstaller<'a> {
    host: &'a dyn ServiceHost,
    units: UnitConfig,
    budget: VerifyBudget,
    journal_lines: usize,
}

impl<'a> SystemdInstaller<'a> {
    pub fn new(host: &'a dyn ServiceHost, units: UnitConfig) -> Self {
        Self {
            host,
            units,
            budget: VerifyBudget::from_secs(2),
            journal_lines: 20,
        }
    }

    pub fn with_budget(mut self, budget: VerifyBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_journal_lines(mut self, n: usize) -> Self {
        self.journal_lines = n;
        self
    }

    pub fn units(&self) -> &UnitConfig {
        &self.units
    }

    fn systemctl(&self, args: &str) -> Result<()> {
        self.host
            .run_checked(&format!("{}systemctl {args}", self.host.sudo()))
    }

    /// Copy the artifact next to the destination, then rename over it.
    ///
    /// The running binary is never truncated or unlinked before its replacement is complete.
    pub fn stage_binary(&self, artifact: &Artifact) -> Result<()> {
        let dest = self.units.binary_path().display().to_string();
        let staged = format!("{dest}.new");
        let sudo = self.host.sudo();
        self.host.run_checked(&format!(
            "{sudo}install -D -m 0755 {} {} && {sudo}mv -f {} {}",
            shell_escape(&artifact.path),
            shell_escape(&staged),
            shell_escape(&staged),
            shell_escape(&dest)
        ))
    }

    pub fn install_units(&self, version: &str) -> Result<()> {
        let pair = units::generate(&self.units, version)?;
        let socket = format!("{UNIT_DIR}/{}", self.units.socket_unit_name());
        let service = format!("{UNIT_DIR}/{}", self.units.service_unit_name());
        self.host.write_privileged(&socket, &pair.socket, Some(0o644))?;
        self.host.write_privileged(&service, &pair.service, Some(0o644))?;
        Ok(())
    }

    pub fn daemon_reload(&self) -> Result<()> {
        self.systemctl("daemon-reload")
    }

    pub fn service_state(&self) -> Result<String> {
        self.host.unit_state(&self.units.service_unit_name())
    }

    pub fn socket_state(&self) -> Result<String> {
        self.host.unit_state(&self.units.socket_unit_name())
    }

    /// Reload a running service in place, or start socket then service.
    pub fn activate(&self) -> Result<Activation> {
        let socket = shell_escape(&self.units.socket_unit_name());
        let service = shell_escape(&self.units.service_unit_name());
        self.systemctl(&format!("enable {socket} {service}"))?;
        if self.service_state()? == "active" {
            tracing::info!(unit = %service, "service active; reloading in place");
            self.systemctl(&format!("reload {service}"))?;
            Ok(Activation::Reloaded)
        } else {
            tracing::info!(unit = %service, "service inactive; starting socket then service");
            self.systemctl(&format!("start {socket}"))?;
            self.systemctl(&format!("start {service}"))?;
            Ok(Activation::Started)
        }
    }

    /// Stage the binary, write units, reload the manager, activate.
    pub fn install(&self, artifact: &Artifact, version: &str) -> Result<Activation, DevError> {
        self.stage_binary(artifact)?;
        self.install_units(version)?;
        self.daemon_reload()?;
        Ok(self.activate()?)
    }

    /// Poll until the service is active; on timeout fail with the journal tail.
    pub fn verify(&self) -> Result<(), DevError> {
        thread::sleep(self.budget.settle);
        let mut last = String::new();
        for attempt in 0..self.budget.attempts.max(1) {
            if attempt > 0 {
                thread::sleep(self.budget.interval);
            }
            last = self.service_state()?;
            if last == "active" {
                return Ok(());
            }
            tracing::debug!(state = %last, attempt, "service not active yet");
        }
        tracing::debug!(state = %last, "activation verification failed");
        Err(DevError::Activation {
            unit: self.units.service_unit_name(),
            log_tail: self.journal_tail(),
        })
    }

    pub fn journal_tail(&self) -> String {
        let script = format!(
            "{}journalctl -u {} -n {} --no-pager",
            self.host.sudo(),
            shell_escape(&self.units.service_unit_name()),
            self.journal_lines
        );
        match self.host.run(&script) {
            Ok(out) => tail_lines(&out.stdout, self.journal_lines),
            Err(e) => format!("(journal unavailable: {e})"),
        }
    }

    pub fn restart(&self) -> Result<()> {
        self.systemctl(&format!(
            "restart {}",
            shell_escape(&self.units.service_unit_name())
        ))
    }

    /// Stop the service and release the port by stopping the socket too.
    pub fn stop(&self) -> Result<()> {
        self.systemctl(&format!(
            "stop {} {}",
            shell_escape(&self.units.service_unit_name()),
            shell_escape(&self.units.socket_unit_name())
        ))
    }

    pub fn status(&self) -> Result<Vec<StatusLine>> {
        let mut lines = vec![
            ("substrate".to_string(), self.host.describe()),
            (self.units.socket_unit_name(), self.socket_state()?),
            (self.units.service_unit_name(), self.service_state()?),
        ];
        let env = self.host.run(&format!(
            "systemctl show {} --property=Environment --value",
            shell_escape(&self.units.service_unit_name())
        ))?;
        if let Some(v) = installed_version(&env.stdout) {
            lines.push(("installed version".to_string(), v));
        }
        Ok(lines)
    }
}

/// `PHOENIX_VERSION` from `systemctl show --property=Environment --value` output.
pub fn installed_version(show_output: &str) -> Option<String> {
    show_output
        .split_whitespace()
        .find_map(|kv| kv.strip_prefix("PHOENIX_VERSION="))
        .map(str::to_string)
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_installed_version_parses_show_output() {
        let out = "PHOENIX_DB_PATH=/x/prod.db PHOENIX_VERSION=v1.4.0 LLM_GATEWAY=http://gw\n";
        assert_eq!(installed_version(out).as_deref(), Some("v1.4.0"));
        assert_eq!(installed_version(""), None);
        assert_eq!(installed_version("PHOENIX_VERSION="), None);
    }

    #[test]
    fn test_verify_budget_defaults() {
        let b = VerifyBudget::from_secs(2);
        assert_eq!(b.settle, Duration::from_secs(2));
        assert_eq!(b.attempts, 5);
        assert_eq!(VerifyBudget::IMMEDIATE.settle, Duration::ZERO);
    }
}
