//! Host systemd target.
use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::unsync::OnceCell;

use super::build::{self, BuildSpec};
use super::credentials::{self, EnvCredentials};
use super::host::{LocalHost, ServiceHost};
use super::overrides;
use super::systemd::{SystemdInstaller, VerifyBudget};
use super::{Activation, Artifact, Deployment, Release, StatusLine};
use crate::config::{under_root, Config};
use crate::detect::DeploymentTarget;
use crate::health;
use crate::units::{CredentialDelivery, UnitConfig};
use crate::util::CommandRunner;
use crate::DevError;

pub struct NativeDeployment<'a> {
    root: PathBuf,
    config: &'a Config,
    data_dir: PathBuf,
    host: LocalHost,
    runner: CommandRunner,
    units: OnceCell<UnitConfig>,
}

impl<'a> NativeDeployment<'a> {
    pub fn new(root: &Path, config: &'a Config, data_dir: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            config,
            data_dir: data_dir.to_path_buf(),
            host: LocalHost::new(),
            runner: CommandRunner::new(),
            units: OnceCell::new(),
        }
    }

    pub fn host(&self) -> &dyn ServiceHost {
        &self.host
    }

    pub fn build_spec(&self) -> BuildSpec {
        BuildSpec {
            cargo_bin: self.config.cargo_bin.clone(),
            ui_dir: self.config.ui_dir.clone(),
            target: Some(self.config.prod.musl_target.clone()).filter(|t| !t.is_empty()),
            cc: Some(self.config.prod.musl_cc.clone()).filter(|c| !c.is_empty()),
        }
    }

    pub fn build_dir(&self) -> PathBuf {
        under_root(&self.root, &self.config.prod.build_worktree)
    }

    fn env_file(&self) -> String {
        self.config.prod.env_file.display().to_string()
    }

    pub fn unit_config(&self, credentials: CredentialDelivery) -> UnitConfig {
        let user = if self.config.prod.user.trim().is_empty() {
            invoking_user()
        } else {
            self.config.prod.user.clone()
        };
        UnitConfig {
            service_name: self.config.service_name.clone(),
            user,
            data_path: self.data_dir.join("prod.db"),
            install_dir: self.config.prod.install_dir.clone(),
            port: self.config.prod.port,
            credentials,
        }
    }

    /// Units as installed by this run, or as named by configuration for status and stop.
    fn current_units(&self) -> UnitConfig {
        self.units.get().cloned().unwrap_or_else(|| {
            self.unit_config(CredentialDelivery::ExternalFile(PathBuf::from(self.env_file())))
        })
    }

    fn installer(&self, units: UnitConfig) -> SystemdInstaller<'_> {
        SystemdInstaller::new(&self.host, units)
            .with_budget(VerifyBudget::from_secs(self.config.prod.activation_wait_secs))
            .with_journal_lines(self.config.prod.journal_lines)
    }
}

/// Login name of the user running devctl (the user who invoked sudo, if any).
pub fn invoking_user() -> String {
    if let Ok(u) = std::env::var("SUDO_USER") {
        if !u.trim().is_empty() {
            return u;
        }
    }
    match nix::unistd::User::from_uid(nix::unistd::getuid()) {
        Ok(Some(u)) => u.name,
        _ => std::env::var("USER").unwrap_or_else(|_| "root".to_string()),
    }
}

impl Deployment for NativeDeployment<'_> {
    fn target(&self) -> DeploymentTarget {
        DeploymentTarget::Native
    }

    fn build(&self, release: &Release, debug: bool) -> Result<Artifact, DevError> {
        build::local_build(
            &self.runner,
            &self.root,
            &self.build_dir(),
            &self.build_spec(),
            release,
            debug,
        )
    }

    fn install(&self, artifact: &Artifact, release: &Release) -> Result<Activation, DevError> {
        let source = EnvCredentials {
            gateway: &self.config.gateway,
            interactive: false,
        };
        let delivery = credentials::provision_native(&self.host, &source, &self.env_file())?;
        let units = self.units.get_or_init(|| self.unit_config(delivery));
        self.installer(units.clone()).install(artifact, &release.version)
    }

    fn verify(&self, _release: &Release) -> Result<Option<String>, DevError> {
        self.installer(self.current_units()).verify()?;
        Ok(health::probe_version(self.config.prod.port, Duration::from_secs(2)).ok())
    }

    fn status(&self) -> anyhow::Result<Vec<StatusLine>> {
        let units = self.current_units();
        let mut lines = self.installer(units.clone()).status()?;
        lines.push(("port".to_string(), units.port.to_string()));
        let version = health::probe_version(units.port, Duration::from_millis(500))
            .unwrap_or_else(|_| "unreachable".to_string());
        lines.push(("version".to_string(), version));
        for o in overrides::list(&self.host, &self.config.service_name)? {
            lines.push((format!("override {}", o.name), o.value));
        }
        Ok(lines)
    }

    fn stop(&self) -> Result<(), DevError> {
        Ok(self.installer(self.current_units()).stop()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_config_from_prod_settings() {
        let mut cfg = Config::default();
        cfg.prod.user = "svc".into();
        let d = NativeDeployment::new(Path::new("/w/tree"), &cfg, Path::new("/home/svc/.phoenix-ide"));
        let u = d.unit_config(CredentialDelivery::InlineGateway("http://gw".into()));
        assert_eq!(u.user, "svc");
        assert_eq!(u.port, 8031);
        assert_eq!(u.data_path, PathBuf::from("/home/svc/.phoenix-ide/prod.db"));
        assert_eq!(u.binary_path(), PathBuf::from("/opt/phoenix-ide/phoenix-ide"));
        assert_eq!(d.build_dir(), PathBuf::from("/w/tree/../.phoenix-ide-build"));
        assert_eq!(
            d.build_spec().target.as_deref(),
            Some("x86_64-unknown-linux-musl")
        );
    }

    #[test]
    fn test_empty_user_means_invoking_user() {
        let cfg = Config::default();
        let d = NativeDeployment::new(Path::new("/w"), &cfg, Path::new("/d"));
        let u = d.unit_config(CredentialDelivery::ExternalFile("/etc/x".into()));
        assert!(!u.user.is_empty());
        assert_eq!(u.user, invoking_user());
    }
}
