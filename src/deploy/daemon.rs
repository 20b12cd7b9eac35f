//! Daemon fallback: an unmanaged background process tracked by a PID file.
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::Context;

use super::build::{self, BuildSpec};
use super::credentials::{self, CredentialSource, EnvCredentials};
use super::{Activation, Artifact, DaemonPaths, Deployment, Release, StatusLine};
use crate::config::{under_root, Config};
use crate::detect::DeploymentTarget;
use crate::health;
use crate::lock::DbLock;
use crate::process::{self, SpawnSpec, StopBudget};
use crate::util::{tail_lines, CommandRunner};
use crate::DevError;

/// Settle window after spawning the daemon.
pub const DAEMON_SETTLE: Duration = Duration::from_secs(2);
const HEALTH_ATTEMPTS: u32 = 5;

pub struct DaemonDeployment<'a> {
    root: PathBuf,
    config: &'a Config,
    paths: DaemonPaths,
    runner: CommandRunner,
}

impl<'a> DaemonDeployment<'a> {
    pub fn new(root: &Path, config: &'a Config, data_dir: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            config,
            paths: DaemonPaths::new(data_dir),
            runner: CommandRunner::new(),
        }
    }

    pub fn paths(&self) -> &DaemonPaths {
        &self.paths
    }

    pub fn binary_path(&self) -> PathBuf {
        self.paths.bin_dir.join(&self.config.service_name)
    }

    /// Copy to a sibling file, then rename over the installed binary.
    pub fn place_binary(&self, artifact: &Path) -> anyhow::Result<PathBuf> {
        let dest = self.binary_path();
        let staged = dest.with_extension("new");
        fs::create_dir_all(&self.paths.bin_dir)
            .with_context(|| format!("cannot create {}", self.paths.bin_dir.display()))?;
        fs::copy(artifact, &staged)
            .with_context(|| format!("cannot copy {} to {}", artifact.display(), staged.display()))?;
        fs::set_permissions(&staged, fs::Permissions::from_mode(0o755))?;
        fs::rename(&staged, &dest)
            .with_context(|| format!("cannot move {} into place", staged.display()))?;
        Ok(dest)
    }

    pub fn spawn_spec(&self, binary: PathBuf, version: &str, creds: Vec<(String, String)>) -> SpawnSpec {
        let mut spec = SpawnSpec::new(binary);
        spec.env = vec![
            ("PHOENIX_PORT".to_string(), self.config.prod.port.to_string()),
            (
                "PHOENIX_DB_PATH".to_string(),
                self.paths.db.display().to_string(),
            ),
            ("PHOENIX_VERSION".to_string(), version.to_string()),
        ];
        spec.env.extend(creds);
        spec.log_file = Some(self.paths.log.clone());
        spec.settle = DAEMON_SETTLE;
        spec
    }

    /// Stop the previous daemon, put the new binary in place, and spawn it holding the
    /// production lock. Credentials come from `source`.
    pub fn install_with(
        &self,
        artifact: &Artifact,
        release: &Release,
        source: &dyn CredentialSource,
    ) -> Result<Activation, DevError> {
        let creds = credentials::daemon_env(source)?;
        let previous = process::stop(&self.paths.pid, "daemon", StopBudget::DRAIN, None);
        if previous.was_running() {
            tracing::info!(?previous, "previous daemon stopped");
        }
        let leaked = process::reclaim_lock(&self.paths.lock, StopBudget::DRAIN)?;
        if !leaked.is_empty() {
            tracing::info!(?leaked, "stopped leftover processes holding the production lock");
        }
        let binary = self.place_binary(Path::new(&artifact.path))?;

        let mut lock = DbLock::new(&self.paths.lock);
        if !lock.acquire()? {
            return Err(DevError::Contention {
                lock_path: self.paths.lock.clone(),
            });
        }
        let spec = self.spawn_spec(binary, &release.version, creds);
        let pid = process::start(&spec, &self.paths.pid, Some(lock))?;
        tracing::info!(pid, port = self.config.prod.port, "daemon started");
        Ok(if previous.was_running() {
            Activation::Restarted
        } else {
            Activation::Started
        })
    }

    fn log_tail(&self) -> String {
        fs::read_to_string(&self.paths.log)
            .map(|s| tail_lines(&s, self.config.prod.journal_lines))
            .unwrap_or_default()
    }
}

impl Deployment for DaemonDeployment<'_> {
    fn target(&self) -> DeploymentTarget {
        DeploymentTarget::Daemon
    }

    fn build(&self, release: &Release, debug: bool) -> Result<Artifact, DevError> {
        let spec = BuildSpec {
            cargo_bin: self.config.cargo_bin.clone(),
            ui_dir: self.config.ui_dir.clone(),
            target: None,
            cc: None,
        };
        let build_dir = under_root(&self.root, &self.config.prod.build_worktree);
        build::local_build(&self.runner, &self.root, &build_dir, &spec, release, debug)
    }

    fn install(&self, artifact: &Artifact, release: &Release) -> Result<Activation, DevError> {
        let source = EnvCredentials {
            gateway: &self.config.gateway,
            interactive: false,
        };
        self.install_with(artifact, release, &source)
    }

    fn verify(&self, _release: &Release) -> Result<Option<String>, DevError> {
        let mut last_err = None;
        for attempt in 0..HEALTH_ATTEMPTS {
            if attempt > 0 {
                thread::sleep(Duration::from_secs(1));
            }
            match health::probe_version(self.config.prod.port, Duration::from_secs(2)) {
                Ok(v) => return Ok(Some(v)),
                Err(e) => last_err = Some(e),
            }
        }
        if let Some(e) = last_err {
            tracing::debug!(error = %e, "health probe failed");
        }
        Err(DevError::Activation {
            unit: format!("{} daemon", self.config.service_name),
            log_tail: self.log_tail(),
        })
    }

    fn status(&self) -> anyhow::Result<Vec<StatusLine>> {
        let recorded = process::read_pid_file(&self.paths.pid);
        let state = match (recorded, process::current_pid(&self.paths.pid)) {
            (_, Some(pid)) => format!("running (pid {pid})"),
            (Some(pid), None) => format!("dead (stale pid {pid} removed)"),
            (None, None) => "not running".to_string(),
        };
        let mut lines = vec![
            ("daemon".to_string(), state),
            ("port".to_string(), self.config.prod.port.to_string()),
            ("log".to_string(), self.paths.log.display().to_string()),
        ];
        let version = health::probe_version(self.config.prod.port, Duration::from_millis(500))
            .unwrap_or_else(|_| "unreachable".to_string());
        lines.push(("version".to_string(), version));
        Ok(lines)
    }

    fn stop(&self) -> Result<(), DevError> {
        let outcome = process::stop(&self.paths.pid, "daemon", StopBudget::DRAIN, None);
        tracing::info!(?outcome, "daemon stop");
        let leaked = process::reclaim_lock(&self.paths.lock, StopBudget::DRAIN)?;
        if !leaked.is_empty() {
            tracing::info!(?leaked, "stopped leftover processes holding the production lock");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_spec_carries_service_environment() {
        let cfg = Config::default();
        let d = DaemonDeployment::new(Path::new("/w"), &cfg, Path::new("/d"));
        let spec = d.spawn_spec(
            d.binary_path(),
            "v2.0.0",
            vec![("LLM_GATEWAY".into(), "http://gw".into())],
        );
        assert_eq!(spec.program, PathBuf::from("/d/bin/phoenix-ide"));
        assert!(spec.env.contains(&("PHOENIX_PORT".into(), "8031".into())));
        assert!(spec.env.contains(&("PHOENIX_DB_PATH".into(), "/d/prod.db".into())));
        assert!(spec.env.contains(&("PHOENIX_VERSION".into(), "v2.0.0".into())));
        assert!(spec.env.contains(&("LLM_GATEWAY".into(), "http://gw".into())));
        assert_eq!(spec.log_file, Some(PathBuf::from("/d/prod.log")));
        assert_eq!(spec.settle, DAEMON_SETTLE);
    }

    #[test]
    fn test_place_binary_replaces_by_rename() {
        let td = tempfile::tempdir().expect("tmpdir");
        let cfg = Config::default();
        let d = DaemonDeployment::new(Path::new("/w"), &cfg, td.path());
        let art = td.path().join("artifact");
        fs::write(&art, "v1").unwrap();
        let dest = d.place_binary(&art).expect("place v1");
        fs::write(&art, "v2").unwrap();
        assert_eq!(d.place_binary(&art).expect("place v2"), dest);
        assert_eq!(fs::read_to_string(&dest).unwrap(), "v2");
        assert!(!dest.with_extension("new").exists());
        let mode = fs::metadata(&dest).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);
    }

    #[test]
    fn test_status_reports_stale_pid() {
        let td = tempfile::tempdir().expect("tmpdir");
        let cfg = Config {
            prod: crate::config::ProdConfig {
                port: 1,
                ..Default::default()
            },
            ..Config::default()
        };
        let d = DaemonDeployment::new(Path::new("/w"), &cfg, td.path());
        fs::write(&d.paths().pid, "999999999").unwrap();
        let lines = d.status().expect("status");
        assert_eq!(lines[0].1, "dead (stale pid 999999999 removed)");
        assert!(!d.paths().pid.exists());
    }

    struct Gateway;

    impl CredentialSource for Gateway {
        fn gateway(&self) -> Option<String> {
            Some("http://gw.internal".to_string())
        }
        fn api_key(&self) -> Option<String> {
            None
        }
    }

    fn release() -> Release {
        Release {
            git_ref: "v1.0.0".into(),
            version: "v1.0.0".into(),
            tagged: true,
        }
    }

    #[test]
    fn test_install_stops_previous_daemon_before_spawning() {
        let td = tempfile::tempdir().expect("tmpdir");
        let cfg = Config::default();
        let d = DaemonDeployment::new(Path::new("/w"), &cfg, td.path());

        let old_lock = crate::lock::acquire_scoped(&d.paths().lock).expect("lock");
        let mut old = SpawnSpec::new("sleep");
        old.args = vec!["30".to_string()];
        old.settle = Duration::from_millis(200);
        let old_pid = process::start(&old, &d.paths().pid, Some(old_lock)).expect("old daemon");

        let art = td.path().join("artifact");
        fs::write(&art, "#!/bin/sh\nexec sleep 30\n").unwrap();
        let artifact = Artifact {
            path: art.display().to_string(),
        };
        // The old daemon still holds the lock unless it was stopped first.
        let activation = d.install_with(&artifact, &release(), &Gateway).expect("install");
        assert_eq!(activation, Activation::Restarted);
        assert!(!process::is_alive(old_pid));

        let new_pid = process::current_pid(&d.paths().pid).expect("new daemon running");
        assert_ne!(new_pid, old_pid);
        assert_eq!(crate::lock::holder_pid(&d.paths().lock), Some(new_pid));

        d.stop().expect("stop");
        assert!(!process::is_alive(new_pid));
        assert!(!d.paths().pid.exists());
    }

    #[test]
    fn test_failed_health_check_reports_log_tail() {
        let td = tempfile::tempdir().expect("tmpdir");
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .and_then(|l| l.local_addr())
            .expect("free port")
            .port();
        let cfg = Config {
            prod: crate::config::ProdConfig {
                port,
                journal_lines: 2,
                ..Default::default()
            },
            ..Config::default()
        };
        let d = DaemonDeployment::new(Path::new("/w"), &cfg, td.path());
        fs::write(&d.paths().log, "boot\nopening db\npanic: database is locked\n").unwrap();

        match d.verify(&release()) {
            Err(DevError::Activation { unit, log_tail }) => {
                assert_eq!(unit, "phoenix-ide daemon");
                assert_eq!(log_tail, "opening db\npanic: database is locked");
            }
            other => panic!("expected activation failure, got {other:?}"),
        }
    }
}
