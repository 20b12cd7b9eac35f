//! systemd descriptor generation shared by every managed deployment target.
//!
//! Both targets render through the same two functions; a `UnitConfig` is the only thing that
//! can differ between them.
use std::io;
use std::path::PathBuf;

use crate::util::IniText;

pub const DOCUMENTATION_URL: &str = "https://github.com/phoenix-ide/phoenix-ide";

/// Listen backlog kept while the service process is being replaced.
pub const SOCKET_BACKLOG: u32 = 128;
/// Seconds a stopping service may spend draining requests and streams.
pub const STOP_DRAIN_SECS: u32 = 30;
pub const RESTART_SECS: u32 = 1;

/// How the service receives its model credentials. Exactly one is ever emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialDelivery {
    /// `Environment=LLM_GATEWAY=<url>`
    InlineGateway(String),
    /// `EnvironmentFile=<path>` with restricted permissions, holding secret material.
    ExternalFile(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitConfig {
    pub service_name: String,
    pub user: String,
    pub data_path: PathBuf,
    pub install_dir: PathBuf,
    pub port: u16,
    pub credentials: CredentialDelivery,
}

impl UnitConfig {
    pub fn socket_unit_name(&self) -> String {
        format!("{}.socket", self.service_name)
    }

    pub fn service_unit_name(&self) -> String {
        format!("{}.service", self.service_name)
    }

    pub fn binary_path(&self) -> PathBuf {
        self.install_dir.join(&self.service_name)
    }
}

/// Rendered socket and service descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitPair {
    pub socket: String,
    pub service: String,
}

pub fn generate(config: &UnitConfig, version: &str) -> io::Result<UnitPair> {
    Ok(UnitPair {
        socket: socket_unit(config)?,
        service: service_unit(config, version)?,
    })
}

/// The socket unit owns the listening port and stays up across service restarts.
pub fn socket_unit(config: &UnitConfig) -> io::Result<String> {
    let mut t = IniText::new();
    t.section("Unit")
        .kv("Description", format!("{} socket", config.service_name))
        .kv("Documentation", DOCUMENTATION_URL);
    t.section("Socket")
        .comment("Held by systemd; stays open while the service restarts")
        .kv("ListenStream", config.port)
        .kv("NoDelay", "true")
        .kv("Backlog", SOCKET_BACKLOG);
    t.section("Install").kv("WantedBy", "sockets.target");
    t.build()
}

/// The service unit requires the socket, restarts on every exit (including the clean exit
/// after a reload signal), and gets a bounded drain period on stop.
pub fn service_unit(config: &UnitConfig, version: &str) -> io::Result<String> {
    let socket = config.socket_unit_name();
    let mut t = IniText::new();
    t.section("Unit")
        .kv("Description", &config.service_name)
        .kv("Documentation", DOCUMENTATION_URL)
        .kv("Requires", &socket)
        .kv("After", format!("network.target {socket}"));
    t.section("Service")
        .kv("Type", "simple")
        .kv("User", &config.user);
    if let CredentialDelivery::ExternalFile(path) = &config.credentials {
        t.kv("EnvironmentFile", path.display());
    }
    t.kv(
        "Environment",
        environment_assignment("PHOENIX_DB_PATH", &config.data_path.display().to_string()),
    )
    .kv("Environment", environment_assignment("PHOENIX_VERSION", version));
    if let CredentialDelivery::InlineGateway(url) = &config.credentials {
        t.kv("Environment", environment_assignment("LLM_GATEWAY", url));
    }
    t.kv("ExecStart", config.binary_path().display())
        .comment("SIGHUP: finish in-flight work, exit 0; systemd restarts on the same socket")
        .kv("ExecReload", "/bin/kill -HUP $MAINPID")
        .kv("Restart", "always")
        .kv("RestartSec", RESTART_SECS)
        .kv("TimeoutStopSec", STOP_DRAIN_SECS);
    t.section("Install").kv("WantedBy", "multi-user.target");
    t.build()
}

/// Drop-in fragment for a single environment override.
pub fn override_fragment(name: &str, value: &str) -> io::Result<String> {
    let mut t = IniText::new();
    t.section("Service")
        .kv("Environment", environment_assignment(name, value));
    t.build()
}

/// `NAME=value` as systemd reads it: `%` specifiers escaped, quoted when the value has
/// whitespace, quotes or backslashes.
pub fn environment_assignment(name: &str, value: &str) -> String {
    let value = value.replace('%', "%%");
    if value
        .chars()
        .any(|c| c.is_whitespace() || c == '"' || c == '\\')
    {
        let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
        format!("\"{name}={escaped}\"")
    } else {
        format!("{name}={value}")
    }
}

/// Inverse of [`environment_assignment`]: `(name, value)` from the text after `Environment=`.
pub fn parse_environment_assignment(raw: &str) -> Option<(String, String)> {
    let raw = raw.trim();
    let body = match raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
        Some(inner) => {
            let mut out = String::with_capacity(inner.len());
            let mut chars = inner.chars();
            while let Some(c) = chars.next() {
                if c == '\\' {
                    out.extend(chars.next());
                } else {
                    out.push(c);
                }
            }
            out
        }
        None => raw.to_string(),
    };
    let (name, value) = body.split_once('=')?;
    Some((name.to_string(), value.replace("%%", "%")))
}
