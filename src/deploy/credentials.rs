//! Model credentials for the deployed service.
//!
//! A reachable gateway is delivered inline where the target allows it; otherwise a root-owned
//! environment file (mode 600) holds either the gateway or an API key.
use std::env;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::Result;

use super::host::ServiceHost;
use crate::config::GatewayConfig;
use crate::gateway;
use crate::units::CredentialDelivery;
use crate::util::{reject_newlines, shell_escape};
use crate::DevError;

pub const API_KEY_VAR: &str = "ANTHROPIC_API_KEY";
pub const GATEWAY_VAR: &str = "LLM_GATEWAY";

/// Where credential material comes from, resolved before anything is written.
pub trait CredentialSource {
    fn gateway(&self) -> Option<String>;
    fn api_key(&self) -> Option<String>;
}

/// Probe the gateway candidates; read the API key from the environment, or prompt for it
/// when `interactive` and stdin is a terminal.
pub struct EnvCredentials<'a> {
    pub gateway: &'a GatewayConfig,
    pub interactive: bool,
}

impl CredentialSource for EnvCredentials<'_> {
    fn gateway(&self) -> Option<String> {
        gateway::discover(self.gateway)
    }

    fn api_key(&self) -> Option<String> {
        if let Some(k) = env::var(API_KEY_VAR).ok().filter(|k| !k.trim().is_empty()) {
            return Some(k.trim().to_string());
        }
        if self.interactive && atty::is(atty::Stream::Stdin) {
            return prompt_api_key().ok().flatten();
        }
        None
    }
}

fn prompt_api_key() -> io::Result<Option<String>> {
    let mut err = io::stderr();
    write!(err, "{API_KEY_VAR} (input is visible): ")?;
    err.flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let key = line.trim().to_string();
    Ok((!key.is_empty()).then_some(key))
}

fn missing_credentials() -> DevError {
    DevError::prerequisite(
        "no model credentials: no gateway is reachable and no API key is set",
        &[
            "export LLM_GATEWAY=<url> to name a gateway",
            "export ANTHROPIC_API_KEY=<key>",
        ],
    )
}

/// True when `path` already holds a gateway or key line.
pub fn env_file_has_credentials(host: &dyn ServiceHost, path: &str) -> Result<bool> {
    let out = host.run(&format!(
        "{}grep -qE '^({GATEWAY_VAR}|{API_KEY_VAR})=' {}",
        host.sudo(),
        shell_escape(path)
    ))?;
    Ok(out.status.success())
}

pub fn env_file_body(var: &str, value: &str) -> Result<String, DevError> {
    reject_newlines(value, var).map_err(|m| DevError::Other(anyhow::anyhow!(m)))?;
    Ok(format!("{var}={value}\n"))
}

/// Native hosts: inline gateway, else an existing env file, else one written from the API key.
pub fn provision_native(
    host: &dyn ServiceHost,
    source: &dyn CredentialSource,
    env_file: &str,
) -> Result<CredentialDelivery, DevError> {
    if let Some(gw) = source.gateway() {
        tracing::info!(gateway = %gw, "using model gateway");
        return Ok(CredentialDelivery::InlineGateway(gw));
    }
    if env_file_has_credentials(host, env_file)? {
        tracing::info!(file = %env_file, "using existing credential file");
        return Ok(CredentialDelivery::ExternalFile(PathBuf::from(env_file)));
    }
    let key = source.api_key().ok_or_else(missing_credentials)?;
    host.write_privileged(env_file, &env_file_body(API_KEY_VAR, &key)?, Some(0o600))?;
    Ok(CredentialDelivery::ExternalFile(PathBuf::from(env_file)))
}

/// Isolated VM: always an env file inside the VM, populated once.
///
/// A loopback gateway is rewritten to the address the VM reaches the host on.
pub fn provision_isolated(
    host: &dyn ServiceHost,
    source: &dyn CredentialSource,
    env_file: &str,
) -> Result<CredentialDelivery, DevError> {
    let delivery = CredentialDelivery::ExternalFile(PathBuf::from(env_file));
    if env_file_has_credentials(host, env_file)? {
        tracing::info!(file = %env_file, "credential file already provisioned");
        return Ok(delivery);
    }
    let body = match source.gateway() {
        Some(gw) => env_file_body(GATEWAY_VAR, &gateway::for_vm(&gw))?,
        None => {
            let key = source.api_key().ok_or_else(missing_credentials)?;
            env_file_body(API_KEY_VAR, &key)?
        }
    };
    host.write_privileged(env_file, &body, Some(0o600))?;
    Ok(delivery)
}

/// Daemon: variables passed straight into the spawned process environment.
pub fn daemon_env(source: &dyn CredentialSource) -> Result<Vec<(String, String)>, DevError> {
    if let Some(gw) = source.gateway() {
        return Ok(vec![(GATEWAY_VAR.to_string(), gw)]);
    }
    let key = source.api_key().ok_or_else(missing_credentials)?;
    Ok(vec![(API_KEY_VAR.to_string(), key)])
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Option<&'static str>, Option<&'static str>);

    impl CredentialSource for Fixed {
        fn gateway(&self) -> Option<String> {
            self.0.map(str::to_string)
        }
        fn api_key(&self) -> Option<String> {
            self.1.map(str::to_string)
        }
    }

    #[test]
    fn test_daemon_env_prefers_gateway() {
        assert_eq!(
            daemon_env(&Fixed(Some("http://gw"), Some("k"))).unwrap(),
            vec![("LLM_GATEWAY".to_string(), "http://gw".to_string())]
        );
        assert_eq!(
            daemon_env(&Fixed(None, Some("k"))).unwrap(),
            vec![("ANTHROPIC_API_KEY".to_string(), "k".to_string())]
        );
        assert!(matches!(
            daemon_env(&Fixed(None, None)),
            Err(DevError::Prerequisite { .. })
        ));
    }

    #[test]
    fn test_env_file_body_rejects_newlines() {
        assert_eq!(env_file_body("X", "v").unwrap(), "X=v\n");
        assert!(env_file_body("X", "v\nY=z").is_err());
    }
}
