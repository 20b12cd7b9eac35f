//! Isolated target: systemd inside the Lima VM.
//!
//! The source is streamed (or fetched) into the VM and built there; units are installed and
//! activated through the VM's shell with the same installer the native target uses.
use std::path::{Path, PathBuf};

use once_cell::unsync::OnceCell;

use super::build::build_step;
use super::credentials::{self, EnvCredentials};
use super::host::{ServiceHost, VmHost};
use super::systemd::{SystemdInstaller, VerifyBudget};
use super::{Activation, Artifact, Deployment, Release, StatusLine};
use crate::config::{Config, VmSource};
use crate::detect::DeploymentTarget;
use crate::health::{extract_version, version_url};
use crate::units::{CredentialDelivery, UnitConfig};
use crate::util::{shell_escape, Cmd, CommandRunner};
use crate::vm::{LimaVm, VmStatus};
use crate::DevError;

/// Paths left out of the streamed tree.
pub const SYNC_EXCLUDES: &[&str] = &["target", "node_modules", ".git"];

pub struct IsolatedDeployment<'a> {
    root: PathBuf,
    config: &'a Config,
    host: VmHost,
    runner: CommandRunner,
    units: OnceCell<UnitConfig>,
}

impl<'a> IsolatedDeployment<'a> {
    pub fn new(root: &Path, config: &'a Config) -> Self {
        Self {
            root: root.to_path_buf(),
            config,
            host: VmHost::new(LimaVm::new(config.vm.name.clone())),
            runner: CommandRunner::new(),
            units: OnceCell::new(),
        }
    }

    pub fn unit_config(&self, credentials: CredentialDelivery) -> UnitConfig {
        let vm = &self.config.vm;
        UnitConfig {
            service_name: self.config.service_name.clone(),
            user: vm.user.clone(),
            data_path: PathBuf::from(&vm.data_path),
            install_dir: PathBuf::from(&vm.install_dir),
            port: self.config.prod.port,
            credentials,
        }
    }

    fn current_units(&self) -> UnitConfig {
        self.units.get().cloned().unwrap_or_else(|| {
            self.unit_config(CredentialDelivery::ExternalFile(PathBuf::from(
                &self.config.vm.env_file,
            )))
        })
    }

    fn installer(&self, units: UnitConfig) -> SystemdInstaller<'_> {
        SystemdInstaller::new(&self.host, units)
            .with_budget(VerifyBudget::from_secs(self.config.prod.activation_wait_secs))
            .with_journal_lines(self.config.prod.journal_lines)
    }

    /// Local command producing a tar stream of the source to build.
    ///
    /// A tagged release is archived from git at the tag; otherwise the working tree is
    /// streamed without build outputs or version-control metadata.
    pub fn archive_cmd(&self, release: &Release) -> Cmd {
        if release.tagged {
            return Cmd::new("git")
                .arg("-C")
                .arg(&self.root)
                .args(["archive", "--format=tar", release.git_ref.as_str()]);
        }
        let mut cmd = Cmd::new("tar").arg("-cf").arg("-");
        for ex in SYNC_EXCLUDES {
            cmd = cmd.arg(format!("--exclude={ex}"));
        }
        cmd.arg(".")
            .cwd(&self.root)
            // macOS tar: no AppleDouble entries.
            .env("COPYFILE_DISABLE", "1")
    }

    /// Replace the VM build tree with the streamed archive, keeping build caches.
    pub fn extract_script(&self) -> String {
        let dir = shell_escape(&self.config.vm.build_dir);
        format!(
            "sudo mkdir -p {dir} && sudo chown \"$(id -u):$(id -g)\" {dir} && \
             find {dir} -mindepth 1 -maxdepth 1 ! -name target ! -name node_modules -exec rm -rf {{}} + && \
             tar -xf - -C {dir} --warning=no-unknown-keyword"
        )
    }

    fn stream_source(&self, release: &Release) -> Result<(), DevError> {
        tracing::info!(vm = %self.config.vm.name, git_ref = %release.git_ref, "streaming source into VM");
        let vm = self.host.vm();
        let out = self.runner.pipe(
            self.archive_cmd(release),
            vm.bash(&self.extract_script()).capture_output(true),
        )?;
        if !out.status.success() {
            return Err(DevError::Build(format!(
                "extracting source in Lima VM '{}' failed: {}",
                self.config.vm.name,
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Clone mode: the VM fetches from the remote, so every local commit must be pushed.
    fn fetch_in_vm(&self, release: &Release) -> Result<(), DevError> {
        let out = self.runner.run(
            Cmd::new("git")
                .arg("-C")
                .arg(&self.root)
                .args(["log", "@{u}..HEAD", "--oneline"])
                .capture_output(true),
        )?;
        if !out.status.success() {
            return Err(DevError::prerequisite(
                "current branch has no upstream; the VM builds from the remote",
                &["git push -u origin <branch>"],
            ));
        }
        let unpushed = out.stdout_trimmed();
        if !unpushed.is_empty() {
            return Err(DevError::prerequisite(
                format!("unpushed commits would not be deployed:\n{unpushed}"),
                &["git push", "or set vm.source: stream in devctl.yaml"],
            ));
        }
        let dir = shell_escape(&self.config.vm.build_dir);
        let script = format!(
            "cd {dir} && git fetch --tags --force origin && git checkout --force --detach {}",
            shell_escape(&release.git_ref)
        );
        self.host.run_checked(&script)?;
        Ok(())
    }

    pub fn build_script(&self, debug: bool) -> String {
        let dir = shell_escape(&self.config.vm.build_dir);
        let ui = shell_escape(&self.config.ui_dir.display().to_string());
        let bin = shell_escape(&self.config.cargo_bin);
        let profile = if debug {
            "CARGO_PROFILE_RELEASE_DEBUG=true "
        } else {
            ""
        };
        let mut s = format!(
            "set -e; cd {dir}; \
             if [ -f {ui}/package.json ]; then (cd {ui} && npm ci && npm run build); fi; \
             {profile}cargo build --release --bin {bin}"
        );
        if !debug {
            s.push_str(&format!("; strip target/release/{bin}"));
        }
        s
    }

    pub fn artifact_path(&self) -> String {
        format!(
            "{}/target/release/{}",
            self.config.vm.build_dir.trim_end_matches('/'),
            self.config.cargo_bin
        )
    }
}

impl Deployment for IsolatedDeployment<'_> {
    fn target(&self) -> DeploymentTarget {
        DeploymentTarget::Isolated
    }

    fn build(&self, release: &Release, debug: bool) -> Result<Artifact, DevError> {
        self.host.vm().ensure_running()?;
        match self.config.vm.source {
            VmSource::Stream => self.stream_source(release)?,
            VmSource::Clone => self.fetch_in_vm(release)?,
        }
        build_step(&self.runner, self.host.vm().bash(&self.build_script(debug)))?;
        Ok(Artifact {
            path: self.artifact_path(),
        })
    }

    fn install(&self, artifact: &Artifact, release: &Release) -> Result<Activation, DevError> {
        let source = EnvCredentials {
            gateway: &self.config.gateway,
            interactive: true,
        };
        let delivery =
            credentials::provision_isolated(&self.host, &source, &self.config.vm.env_file)?;
        let units = self.units.get_or_init(|| self.unit_config(delivery));
        self.installer(units.clone()).install(artifact, &release.version)
    }

    fn verify(&self, _release: &Release) -> Result<Option<String>, DevError> {
        self.installer(self.current_units()).verify()?;
        Ok(self.probe_in_vm())
    }

    fn status(&self) -> anyhow::Result<Vec<StatusLine>> {
        let vm_state = self.host.vm().status();
        let mut lines = vec![("vm".to_string(), format!("{} ({vm_state:?})", self.config.vm.name))];
        if vm_state != VmStatus::Running {
            return Ok(lines);
        }
        lines.extend(self.installer(self.current_units()).status()?);
        let version = self.probe_in_vm().unwrap_or_else(|| "unreachable".to_string());
        lines.push(("version".to_string(), version));
        Ok(lines)
    }

    /// Nothing runs in a VM that is not running, so that counts as already stopped.
    fn stop(&self) -> Result<(), DevError> {
        let vm_state = self.host.vm().status();
        if vm_state != VmStatus::Running {
            tracing::info!(vm = %self.config.vm.name, state = ?vm_state, "VM not running; service already stopped");
            return Ok(());
        }
        Ok(self.installer(self.current_units()).stop()?)
    }
}

impl IsolatedDeployment<'_> {
    /// The version endpoint as seen from inside the VM.
    fn probe_in_vm(&self) -> Option<String> {
        let out = self
            .host
            .run(&format!(
                "curl -fsS --max-time 2 {}",
                shell_escape(&version_url(self.config.prod.port))
            ))
            .ok()?;
        out.status
            .success()
            .then(|| extract_version(&out.stdout))
            .filter(|v| !v.is_empty())
    }
}
