//! Deployment target selection.
use std::fmt;
use std::fs;

use anyhow::Result;

use crate::util::{Cmd, CommandRunner};
use crate::vm::{LimaVm, VmStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentTarget {
    /// Host systemd manages the socket and service units.
    Native,
    /// systemd inside the Lima VM, reached over `limactl shell`.
    Isolated,
    /// Unmanaged background process tracked by a PID file.
    Daemon,
    /// Isolation is required but unavailable; terminal.
    Undetermined,
}

impl fmt::Display for DeploymentTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeploymentTarget::Native => "native",
            DeploymentTarget::Isolated => "isolated",
            DeploymentTarget::Daemon => "daemon",
            DeploymentTarget::Undetermined => "undetermined",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOs {
    Linux,
    MacOs,
    Other,
}

impl HostOs {
    pub fn current() -> Self {
        if cfg!(target_os = "linux") {
            HostOs::Linux
        } else if cfg!(target_os = "macos") {
            HostOs::MacOs
        } else {
            HostOs::Other
        }
    }
}

/// Pure decision table.
///
/// | host  | systemd PID 1 | VM exists | result       |
/// |-------|---------------|-----------|--------------|
/// | Linux | yes           | -         | Native       |
/// | Linux | no            | -         | Daemon       |
/// | macOS | -             | yes       | Isolated     |
/// | macOS | -             | no        | Undetermined |
/// | other | -             | -         | Daemon       |
pub fn decide(os: HostOs, init_capable: bool, vm: &VmStatus) -> DeploymentTarget {
    match os {
        HostOs::Linux if init_capable => DeploymentTarget::Native,
        HostOs::Linux => DeploymentTarget::Daemon,
        HostOs::MacOs => match vm {
            VmStatus::Running | VmStatus::Stopped(_) => DeploymentTarget::Isolated,
            VmStatus::Missing | VmStatus::NoTool => DeploymentTarget::Undetermined,
        },
        HostOs::Other => DeploymentTarget::Daemon,
    }
}

/// Host capability probes. Everything except `start_vm` is a read.
pub trait HostProbe {
    fn os(&self) -> HostOs;
    fn init_is_systemd(&self) -> bool;
    fn vm_status(&self) -> VmStatus;
    fn start_vm(&self) -> Result<()>;
}

pub struct SystemProbe<'a> {
    vm: &'a LimaVm,
}

impl<'a> SystemProbe<'a> {
    pub fn new(vm: &'a LimaVm) -> Self {
        Self { vm }
    }
}

impl HostProbe for SystemProbe<'_> {
    fn os(&self) -> HostOs {
        HostOs::current()
    }

    fn init_is_systemd(&self) -> bool {
        init_process_name().is_some_and(|n| n.contains("systemd"))
    }

    fn vm_status(&self) -> VmStatus {
        self.vm.status()
    }

    fn start_vm(&self) -> Result<()> {
        self.vm.start()
    }
}

/// Name of PID 1, from procfs when available, else `ps`.
pub fn init_process_name() -> Option<String> {
    if let Ok(s) = fs::read_to_string("/proc/1/comm") {
        let s = s.trim().to_string();
        if !s.is_empty() {
            return Some(s);
        }
    }
    let out = CommandRunner::with_default_timeout(std::time::Duration::from_secs(5))
        .run(Cmd::new("ps").args(["-p", "1", "-o", "comm="]).capture_output(true))
        .ok()?;
    if !out.status.success() {
        return None;
    }
    let s = out.stdout_trimmed().to_string();
    (!s.is_empty()).then_some(s)
}

/// Pick the target without side effects (for status reporting and diagnostics).
pub fn detect_passive(probe: &dyn HostProbe) -> DeploymentTarget {
    let os = probe.os();
    let init = os == HostOs::Linux && probe.init_is_systemd();
    let vm = if os == HostOs::MacOs {
        probe.vm_status()
    } else {
        VmStatus::Missing
    };
    decide(os, init, &vm)
}

/// Pick the target for an operation; a stopped-but-existing VM is started.
pub fn detect(probe: &dyn HostProbe) -> Result<DeploymentTarget> {
    let os = probe.os();
    let init = os == HostOs::Linux && probe.init_is_systemd();
    let vm = if os == HostOs::MacOs {
        probe.vm_status()
    } else {
        VmStatus::Missing
    };
    let target = decide(os, init, &vm);
    if target == DeploymentTarget::Isolated {
        if let VmStatus::Stopped(state) = &vm {
            tracing::info!(%state, "isolated environment is not running; starting it");
            probe.start_vm()?;
        }
    }
    tracing::debug!(?os, init, ?vm, %target, "deployment target");
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct FakeProbe {
        os: HostOs,
        systemd: bool,
        vm: VmStatus,
        started: Cell<u32>,
    }

    impl HostProbe for FakeProbe {
        fn os(&self) -> HostOs {
            self.os
        }
        fn init_is_systemd(&self) -> bool {
            self.systemd
        }
        fn vm_status(&self) -> VmStatus {
            self.vm.clone()
        }
        fn start_vm(&self) -> Result<()> {
            self.started.set(self.started.get() + 1);
            Ok(())
        }
    }

    fn probe(os: HostOs, systemd: bool, vm: VmStatus) -> FakeProbe {
        FakeProbe {
            os,
            systemd,
            vm,
            started: Cell::new(0),
        }
    }

    #[test]
    fn test_decision_table() {
        use DeploymentTarget::*;
        assert_eq!(decide(HostOs::Linux, true, &VmStatus::Missing), Native);
        assert_eq!(decide(HostOs::Linux, false, &VmStatus::Running), Daemon);
        assert_eq!(decide(HostOs::MacOs, false, &VmStatus::Running), Isolated);
        assert_eq!(
            decide(HostOs::MacOs, true, &VmStatus::Stopped("Stopped".into())),
            Isolated
        );
        assert_eq!(decide(HostOs::MacOs, false, &VmStatus::Missing), Undetermined);
        assert_eq!(decide(HostOs::MacOs, false, &VmStatus::NoTool), Undetermined);
        assert_eq!(decide(HostOs::Other, true, &VmStatus::Running), Daemon);
    }

    #[test]
    fn test_detect_starts_stopped_vm_once() {
        let p = probe(HostOs::MacOs, false, VmStatus::Stopped("Stopped".into()));
        assert_eq!(detect(&p).unwrap(), DeploymentTarget::Isolated);
        assert_eq!(p.started.get(), 1);
    }

    #[test]
    fn test_passive_detect_never_starts_vm() {
        let p = probe(HostOs::MacOs, false, VmStatus::Stopped("Stopped".into()));
        assert_eq!(detect_passive(&p), DeploymentTarget::Isolated);
        assert_eq!(p.started.get(), 0);
    }

    #[test]
    fn test_running_vm_is_not_restarted() {
        let p = probe(HostOs::MacOs, false, VmStatus::Running);
        assert_eq!(detect(&p).unwrap(), DeploymentTarget::Isolated);
        assert_eq!(p.started.get(), 0);
    }
}
