use std::env;
use std::path::Path;
use std::time::Duration;

use crate::config::{Config, CONFIG_FILE_NAME};
use crate::detect::{self, HostOs, SystemProbe};
use crate::identity::identity_with;
use crate::vm::{LimaVm, VmStatus};

const TOOLS: &[&str] = &[
    "git", "cargo", "npm", "strip", "tar", "systemctl", "journalctl", "limactl",
];

pub fn build_info() -> String {
    format!(
        "built {} for {} ({}, {})",
        option_env!("DEVCTL_BUILD_DATE").unwrap_or("unknown"),
        option_env!("DEVCTL_BUILD_TARGET").unwrap_or("unknown"),
        option_env!("DEVCTL_BUILD_PROFILE").unwrap_or("unknown"),
        option_env!("DEVCTL_BUILD_RUSTC").unwrap_or("unknown"),
    )
}

/// Diagnostics to stderr. Reads only: the VM is never started.
pub fn run_doctor(root: &Path, data_dir: &Path, config: &Config, verbose: bool) {
    let use_err = crate::color_enabled_stderr();
    let val = |s: &str| crate::paint(use_err, "\x1b[34;1m", s);

    eprintln!("devctl doctor");
    eprintln!();
    eprintln!("  version: v{}", env!("CARGO_PKG_VERSION"));
    if verbose {
        eprintln!("           {}", build_info());
    }
    eprintln!(
        "  host:    {} / {}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );

    let init = detect::init_process_name().unwrap_or_else(|| "unknown".to_string());
    eprintln!("  init:    {}", val(&init));

    let vm = LimaVm::new(config.vm.name.clone());
    let vm_state = match vm.status() {
        VmStatus::Running => format!("'{}' running", config.vm.name),
        VmStatus::Stopped(s) => format!("'{}' {}", config.vm.name, s.to_lowercase()),
        VmStatus::Missing => format!("'{}' not created", config.vm.name),
        VmStatus::NoTool => "limactl not installed".to_string(),
    };
    eprintln!("  lima vm: {}", val(&vm_state));

    let target = detect::detect_passive(&SystemProbe::new(&vm));
    eprintln!("  target:  {}", val(&target.to_string()));
    if target == detect::DeploymentTarget::Undetermined && HostOs::current() == HostOs::MacOs {
        crate::log_warn_stderr(
            use_err,
            "  no deployment target: create the VM with 'devctl vm create'",
        );
    }
    eprintln!();

    eprintln!("  tools:");
    for tool in TOOLS {
        let found = match which::which(tool) {
            Ok(p) => p.display().to_string(),
            Err(_) => "(not found)".to_string(),
        };
        eprintln!("    {:<11} {}", tool, found);
    }
    eprintln!();

    let id = identity_with(root, data_dir, &config.ports);
    eprintln!("  worktree:    {}", root.display());
    eprintln!("  fingerprint: {}", val(&id.fingerprint));
    eprintln!(
        "  dev ports:   {} (service), {} (ui)",
        id.primary_port, id.secondary_port
    );
    eprintln!("  database:    {}", id.db_path.display());
    let config_path = env::var("DEVCTL_CONFIG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| root.join(CONFIG_FILE_NAME));
    eprintln!(
        "  config:      {} ({})",
        config_path.display(),
        if config_path.is_file() {
            "found"
        } else {
            "defaults"
        }
    );
    eprintln!();

    let timeout = Duration::from_millis(config.gateway.probe_timeout_ms);
    eprintln!("  gateways:");
    for url in crate::gateway::candidates(&config.gateway) {
        let ok = crate::gateway::is_reachable(&url, timeout);
        eprintln!(
            "    {:<40} {}",
            url,
            if ok { "reachable" } else { "unreachable" }
        );
    }
    let key = env::var("ANTHROPIC_API_KEY")
        .map(|k| !k.trim().is_empty())
        .unwrap_or(false);
    eprintln!("  api key:     {}", if key { "set" } else { "not set" });
    eprintln!();
    eprintln!("doctor: completed diagnostics.");
}
