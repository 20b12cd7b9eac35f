//! Repository configuration: `devctl.yaml` at the worktree root plus `DEVCTL_*` environment.
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::identity::PortPlan;

pub const CONFIG_FILE_NAME: &str = "devctl.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// systemd unit base name and installed binary name.
    pub service_name: String,
    /// Cargo binary produced by the backend build.
    pub cargo_bin: String,
    /// UI package directory, relative to the worktree root.
    pub ui_dir: PathBuf,
    pub ports: PortPlan,
    pub dev: DevConfig,
    pub prod: ProdConfig,
    pub vm: VmConfig,
    pub gateway: GatewayConfig,
    /// Commands run by `devctl check`, in order; each is an argv vector run at the worktree root.
    pub checks: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DevConfig {
    pub pid_file: PathBuf,
    pub ui_pid_file: PathBuf,
    pub log_file: PathBuf,
    pub ui_log_file: PathBuf,
    /// Default RUST_LOG handed to the dev service when the caller has none.
    pub rust_log: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProdConfig {
    pub install_dir: PathBuf,
    pub port: u16,
    /// Service user on native hosts; empty means the invoking user.
    pub user: String,
    /// Reusable build checkout; relative paths resolve against the worktree root.
    pub build_worktree: PathBuf,
    pub musl_target: String,
    pub musl_cc: String,
    /// Credential file used when no gateway is reachable on a native host.
    pub env_file: PathBuf,
    pub activation_wait_secs: u64,
    pub journal_lines: usize,
}

/// Where the isolated VM builds from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmSource {
    /// Archive-stream the working tree into the VM.
    Stream,
    /// The VM keeps its own clone and fetches; unpushed commits are rejected.
    Clone,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VmConfig {
    pub name: String,
    /// Lima template, relative to the worktree root.
    pub template: PathBuf,
    pub build_dir: String,
    pub env_file: String,
    pub user: String,
    pub data_path: String,
    pub install_dir: String,
    pub source: VmSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub local_proxy: String,
    /// JSON file whose `llm_gateway` key names a gateway.
    pub host_config: PathBuf,
    pub fallback: String,
    pub probe_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "phoenix-ide".to_string(),
            cargo_bin: "phoenix_ide".to_string(),
            ui_dir: PathBuf::from("ui"),
            ports: PortPlan::default(),
            dev: DevConfig::default(),
            prod: ProdConfig::default(),
            vm: VmConfig::default(),
            gateway: GatewayConfig::default(),
            checks: vec![
                argv(&["cargo", "clippy", "--", "-D", "warnings"]),
                argv(&["cargo", "fmt", "--check"]),
                argv(&["cargo", "test"]),
                argv(&["npm", "--prefix", "ui", "run", "lint"]),
            ],
        }
    }
}

impl Default for DevConfig {
    fn default() -> Self {
        Self {
            pid_file: PathBuf::from(".phoenix.pid"),
            ui_pid_file: PathBuf::from(".vite.pid"),
            log_file: PathBuf::from("phoenix.log"),
            ui_log_file: PathBuf::from("vite.log"),
            rust_log: "phoenix_ide=debug,tower_http=debug".to_string(),
        }
    }
}

impl Default for ProdConfig {
    fn default() -> Self {
        Self {
            install_dir: PathBuf::from("/opt/phoenix-ide"),
            port: 8031,
            user: String::new(),
            build_worktree: PathBuf::from("../.phoenix-ide-build"),
            musl_target: "x86_64-unknown-linux-musl".to_string(),
            musl_cc: "x86_64-linux-musl-gcc".to_string(),
            env_file: PathBuf::from("/etc/phoenix-ide/env"),
            activation_wait_secs: 2,
            journal_lines: 20,
        }
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            name: "phoenix-ide".to_string(),
            template: PathBuf::from("lima/phoenix-ide.yaml"),
            build_dir: "/opt/phoenix-build".to_string(),
            env_file: "/etc/phoenix-ide/env".to_string(),
            user: "phoenix-ide".to_string(),
            data_path: "/mnt/phoenix-data/prod.db".to_string(),
            install_dir: "/opt/phoenix-ide".to_string(),
            source: VmSource::Stream,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            local_proxy: "http://127.0.0.1:8462".to_string(),
            host_config: PathBuf::from("/exe.dev/shelley.json"),
            fallback: "http://169.254.169.254/gateway/llm".to_string(),
            probe_timeout_ms: 500,
        }
    }
}

fn argv(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

impl Config {
    /// Load `.env` (existing variables win), then `DEVCTL_CONFIG` or `<root>/devctl.yaml`.
    /// A missing file yields defaults; a malformed one is an error.
    pub fn load(root: &Path) -> Result<Self> {
        let _ = dotenvy::from_path(root.join(".env"));
        let path = env::var("DEVCTL_CONFIG")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| root.join(CONFIG_FILE_NAME));
        let cfg = if path.is_file() {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Self::from_yaml(&text).with_context(|| format!("invalid {}", path.display()))?
        } else {
            tracing::debug!(path = %path.display(), "no config file; using defaults");
            Self::default()
        };
        cfg.ports.validate().map_err(anyhow::Error::msg)?;
        Ok(cfg)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }
}

/// Directory holding per-worktree databases and lock files, and the daemon-mode state.
///
/// `DEVCTL_DATA_DIR` wins; otherwise `~/.phoenix-ide`.
pub fn data_dir() -> PathBuf {
    if let Ok(v) = env::var("DEVCTL_DATA_DIR") {
        if !v.trim().is_empty() {
            return PathBuf::from(v);
        }
    }
    home::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".phoenix-ide")
}

/// The worktree root: `--root` if given, else the current directory; canonicalized.
pub fn resolve_root(explicit: Option<&Path>) -> Result<PathBuf> {
    let raw = match explicit {
        Some(p) => p.to_path_buf(),
        None => env::current_dir().context("cannot determine current directory")?,
    };
    fs::canonicalize(&raw).with_context(|| format!("worktree root {} not found", raw.display()))
}

/// Resolve `p` against `root` unless it is already absolute.
pub fn under_root(root: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        root.join(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_deployment_constants() {
        let c = Config::default();
        assert_eq!(c.service_name, "phoenix-ide");
        assert_eq!(c.prod.port, 8031);
        assert_eq!(c.vm.source, VmSource::Stream);
        assert_eq!(c.ports, PortPlan::default());
        assert_eq!(c.checks.len(), 4);
    }

    #[test]
    fn test_partial_yaml_keeps_other_defaults() {
        let c = Config::from_yaml(
            "service_name: demo\nprod:\n  port: 9100\nvm:\n  source: clone\n",
        )
        .expect("parse");
        assert_eq!(c.service_name, "demo");
        assert_eq!(c.prod.port, 9100);
        assert_eq!(c.prod.install_dir, PathBuf::from("/opt/phoenix-ide"));
        assert_eq!(c.vm.source, VmSource::Clone);
        assert_eq!(c.vm.name, "phoenix-ide");
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(Config::from_yaml("servce_name: typo\n").is_err());
    }

    #[test]
    fn test_empty_yaml_is_default() {
        assert_eq!(Config::from_yaml("  \n").unwrap(), Config::default());
    }

    #[test]
    fn test_under_root() {
        let root = Path::new("/w/tree");
        assert_eq!(under_root(root, Path::new("ui")), PathBuf::from("/w/tree/ui"));
        assert_eq!(under_root(root, Path::new("/abs")), PathBuf::from("/abs"));
    }
}
