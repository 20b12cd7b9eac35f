/*!
Test support helpers shared across integration tests.

- have_git(): check git availability on PATH
- have(bin): check any tool on PATH
- RecordingHost: a ServiceHost that records every script and answers unit-state queries from
  a script of canned states; selected scripts can be made to fail
*/

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, ExitStatus, Stdio};

use devctl as dc;
use dc::deploy::ServiceHost;
use dc::util::ExecOutput;

/// Return true if `git` is available on PATH.
pub fn have_git() -> bool {
    have("git")
}

pub fn have(bin: &str) -> bool {
    Command::new("sh")
        .args(["-c", &format!("command -v {bin}")])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn exit(code: i32) -> ExitStatus {
    ExitStatus::from_raw(code << 8)
}

pub fn output(code: i32, stdout: &str) -> ExecOutput {
    ExecOutput {
        status: exit(code),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

/// Everything the orchestrator asked the substrate to do, in order.
#[derive(Default)]
pub struct RecordingHost {
    pub scripts: RefCell<Vec<String>>,
    pub writes: RefCell<Vec<(String, String, Option<u32>)>>,
    /// Answers to `systemctl is-active` for the service unit; the last one repeats.
    pub service_states: RefCell<VecDeque<String>>,
    /// Stdout returned for any other captured script.
    pub listing: RefCell<String>,
    pub journal: String,
    /// Captured scripts containing any of these exit 1 with no output.
    pub failing: RefCell<Vec<String>>,
}

impl RecordingHost {
    pub fn with_states(states: &[&str]) -> Self {
        let h = Self::default();
        h.service_states
            .borrow_mut()
            .extend(states.iter().map(|s| s.to_string()));
        h
    }

    pub fn scripts(&self) -> Vec<String> {
        self.scripts.borrow().clone()
    }

    pub fn fail_when(&self, needle: &str) {
        self.failing.borrow_mut().push(needle.to_string());
    }

    /// Index of the first recorded script containing `needle`.
    pub fn position(&self, needle: &str) -> Option<usize> {
        self.scripts.borrow().iter().position(|s| s.contains(needle))
    }

    fn next_state(&self) -> String {
        let mut q = self.service_states.borrow_mut();
        if q.len() > 1 {
            q.pop_front().unwrap_or_default()
        } else {
            q.front().cloned().unwrap_or_else(|| "inactive".to_string())
        }
    }
}

impl ServiceHost for RecordingHost {
    fn describe(&self) -> String {
        "recording host".to_string()
    }

    fn run(&self, script: &str) -> anyhow::Result<ExecOutput> {
        self.scripts.borrow_mut().push(script.to_string());
        if self.failing.borrow().iter().any(|n| script.contains(n.as_str())) {
            return Ok(output(1, ""));
        }
        if script.contains("journalctl") {
            return Ok(output(0, &self.journal));
        }
        Ok(output(0, &self.listing.borrow()))
    }

    fn run_checked(&self, script: &str) -> anyhow::Result<()> {
        self.scripts.borrow_mut().push(script.to_string());
        Ok(())
    }

    fn write_privileged(&self, path: &str, content: &str, mode: Option<u32>) -> anyhow::Result<()> {
        self.writes
            .borrow_mut()
            .push((path.to_string(), content.to_string(), mode));
        Ok(())
    }

    fn sudo(&self) -> &str {
        "sudo "
    }

    fn unit_state(&self, unit: &str) -> anyhow::Result<String> {
        self.scripts
            .borrow_mut()
            .push(format!("systemctl is-active {unit}"));
        if unit.ends_with(".service") {
            Ok(self.next_state())
        } else {
            Ok("active".to_string())
        }
    }
}
