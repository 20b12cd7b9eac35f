//! Environment overrides as systemd drop-in fragments.
//!
//! One fragment per variable under `<unit dir>/<service>.service.d/<NAME>.conf`. Every set or
//! unset is applied immediately: write or remove, reload the manager, restart the service.
use anyhow::Result;

use super::host::ServiceHost;
use super::systemd::UNIT_DIR;
use crate::units::{override_fragment, parse_environment_assignment};
use crate::util::{is_env_name, reject_newlines, shell_escape};
use crate::DevError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Override {
    pub file: String,
    pub name: String,
    pub value: String,
}

pub fn dropin_dir(service_name: &str) -> String {
    format!("{UNIT_DIR}/{service_name}.service.d")
}

pub fn fragment_path(service_name: &str, name: &str) -> String {
    format!("{}/{name}.conf", dropin_dir(service_name))
}

pub fn validate(name: &str, value: Option<&str>) -> Result<(), DevError> {
    if !is_env_name(name) {
        return Err(DevError::Other(anyhow::anyhow!(
            "invalid variable name '{name}': use letters, digits and underscores"
        )));
    }
    if let Some(v) = value {
        reject_newlines(v, "override value").map_err(|m| DevError::Other(anyhow::anyhow!(m)))?;
    }
    Ok(())
}

/// Parse `grep -H '^Environment=' <dir>/*.conf` output, undoing the fragment's quoting.
pub fn parse_listing(output: &str) -> Vec<Override> {
    let mut out = Vec::new();
    for line in output.lines() {
        let Some((file, rest)) = line.split_once(":Environment=") else {
            continue;
        };
        let Some((name, value)) = parse_environment_assignment(rest) else {
            continue;
        };
        out.push(Override {
            file: file.to_string(),
            name,
            value,
        });
    }
    out
}

pub fn list(host: &dyn ServiceHost, service_name: &str) -> Result<Vec<Override>> {
    let dir = dropin_dir(service_name);
    let out = host.run(&format!(
        "{}sh -c {} 2>/dev/null",
        host.sudo(),
        shell_escape(&format!(
            "grep -H '^Environment=' {}/*.conf",
            shell_escape(&dir)
        ))
    ))?;
    Ok(parse_listing(&out.stdout))
}

fn apply(host: &dyn ServiceHost, service_name: &str) -> Result<()> {
    let sudo = host.sudo();
    host.run_checked(&format!("{sudo}systemctl daemon-reload"))?;
    host.run_checked(&format!(
        "{sudo}systemctl restart {}",
        shell_escape(&format!("{service_name}.service"))
    ))
}

/// Write `NAME=value`, dropping any other fragment that sets the same variable.
pub fn set(host: &dyn ServiceHost, service_name: &str, name: &str, value: &str) -> Result<(), DevError> {
    validate(name, Some(value))?;
    let path = fragment_path(service_name, name);
    let conflicts: Vec<String> = list(host, service_name)?
        .into_iter()
        .filter(|o| o.name == name && o.file != path)
        .map(|o| shell_escape(&o.file))
        .collect();
    if !conflicts.is_empty() {
        tracing::info!(files = %conflicts.join(" "), "removing conflicting fragments");
        host.run_checked(&format!("{}rm -f {}", host.sudo(), conflicts.join(" ")))?;
    }
    host.write_privileged(&path, &override_fragment(name, value)?, Some(0o644))?;
    apply(host, service_name)?;
    Ok(())
}

/// Remove the fragment for `name`; returns false when there was none.
pub fn unset(host: &dyn ServiceHost, service_name: &str, name: &str) -> Result<bool, DevError> {
    validate(name, None)?;
    let files: Vec<String> = list(host, service_name)?
        .into_iter()
        .filter(|o| o.name == name)
        .map(|o| shell_escape(&o.file))
        .collect();
    if files.is_empty() {
        return Ok(false);
    }
    host.run_checked(&format!("{}rm -f {}", host.sudo(), files.join(" ")))?;
    apply(host, service_name)?;
    Ok(true)
}
