//! Production deployment.
//!
//! Every target runs the same sequence: resolve the release, build the artifact, install and
//! activate it, verify. A `Deployment` implementation decides how each step executes (host
//! shell, Lima VM shell, or a detached local process); `run` owns the ordering.
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::detect::DeploymentTarget;
use crate::util::{Cmd, CommandRunner};
use crate::DevError;

pub mod build;
pub mod credentials;
pub mod daemon;
pub mod host;
pub mod lima;
pub mod native;
pub mod overrides;
pub mod systemd;

pub use daemon::DaemonDeployment;
pub use host::{LocalHost, ServiceHost, VmHost};
pub use lima::IsolatedDeployment;
pub use native::NativeDeployment;
pub use systemd::{SystemdInstaller, VerifyBudget};

/// What is being deployed: a git ref and the version string the service reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    /// Ref handed to `git checkout`: the tag, or the full commit id of HEAD.
    pub git_ref: String,
    pub version: String,
    /// True when the release names an explicit tag.
    pub tagged: bool,
}

/// Build output, as a path on the substrate that will install it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// Running service was signalled to reload against the held socket.
    Reloaded,
    /// Socket unit then service unit were started.
    Started,
    /// Previous daemon stopped, new one spawned.
    Restarted,
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Activation::Reloaded => "reloaded (zero-downtime)",
            Activation::Started => "started",
            Activation::Restarted => "restarted",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployReport {
    pub target: DeploymentTarget,
    pub version: String,
    pub activation: Activation,
    /// Version reported by the running service, when it could be probed.
    pub observed_version: Option<String>,
}

/// One status line: label and value.
pub type StatusLine = (String, String);

pub trait Deployment {
    fn target(&self) -> DeploymentTarget;

    /// Materialize the source at `release` in the build location and produce the artifact.
    fn build(&self, release: &Release, debug: bool) -> Result<Artifact, DevError>;

    /// Put the artifact in place and bring the service up on it.
    fn install(&self, artifact: &Artifact, release: &Release) -> Result<Activation, DevError>;

    /// Confirm the service is up; returns the observed version when available.
    fn verify(&self, release: &Release) -> Result<Option<String>, DevError>;

    fn status(&self) -> anyhow::Result<Vec<StatusLine>>;

    fn stop(&self) -> Result<(), DevError>;
}

/// Run the full sequence for an already-resolved release.
pub fn run(
    deployment: &dyn Deployment,
    release: &Release,
    debug: bool,
) -> Result<DeployReport, DevError> {
    let target = deployment.target();
    tracing::info!(%target, version = %release.version, git_ref = %release.git_ref, "deploying");
    let artifact = deployment.build(release, debug)?;
    tracing::debug!(artifact = %artifact.path, "artifact ready");
    let activation = deployment.install(&artifact, release)?;
    let observed_version = deployment.verify(release)?;
    Ok(DeployReport {
        target,
        version: release.version.clone(),
        activation,
        observed_version,
    })
}

/// Resolve `tag` (which must exist) or the current HEAD into a `Release`.
///
/// An untagged HEAD that carries an exact tag is reported under that tag; otherwise the
/// version is `dev-<short commit>`.
pub fn resolve_release(root: &Path, tag: Option<&str>) -> Result<Release, DevError> {
    let runner = CommandRunner::new();
    let git = |args: &[&str]| {
        Cmd::new("git")
            .arg("-C")
            .arg(root)
            .args(args.iter().copied())
            .capture_output(true)
    };
    if let Some(tag) = tag {
        let spec = format!("refs/tags/{tag}^{{commit}}");
        let out = runner.run(git(&["rev-parse", "--verify", "--quiet", &spec]))?;
        if !out.status.success() {
            return Err(DevError::prerequisite(
                format!("tag '{tag}' does not exist"),
                &["List tags with: git tag --list", "Create it with: git tag <name>"],
            ));
        }
        return Ok(Release {
            git_ref: tag.to_string(),
            version: tag.to_string(),
            tagged: true,
        });
    }
    let head = runner
        .run_checked(git(&["rev-parse", "HEAD"]))
        .context("cannot resolve HEAD")?;
    let commit = head.stdout_trimmed().to_string();
    let exact = runner.run(git(&["describe", "--tags", "--exact-match", "HEAD"]))?;
    let version = if exact.status.success() && !exact.stdout_trimmed().is_empty() {
        exact.stdout_trimmed().to_string()
    } else {
        dev_version(&commit)
    };
    Ok(Release {
        git_ref: commit,
        version,
        tagged: false,
    })
}

pub fn dev_version(commit: &str) -> String {
    let short: String = commit.chars().take(8).collect();
    format!("dev-{short}")
}

/// Production state files for the daemon target, all under the data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonPaths {
    pub db: PathBuf,
    pub log: PathBuf,
    pub pid: PathBuf,
    pub lock: PathBuf,
    pub bin_dir: PathBuf,
}

impl DaemonPaths {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            db: data_dir.join("prod.db"),
            log: data_dir.join("prod.log"),
            pid: data_dir.join("prod.pid"),
            lock: data_dir.join("prod.lock"),
            bin_dir: data_dir.join("bin"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dev_version_uses_short_commit() {
        assert_eq!(
            dev_version("1a2b3c4d5e6f7a8b9c0d1a2b3c4d5e6f7a8b9c0d"),
            "dev-1a2b3c4d"
        );
        assert_eq!(dev_version("abc"), "dev-abc");
    }

    #[test]
    fn test_daemon_paths_live_in_data_dir() {
        let p = DaemonPaths::new(Path::new("/home/u/.phoenix-ide"));
        assert_eq!(p.db, PathBuf::from("/home/u/.phoenix-ide/prod.db"));
        assert_eq!(p.pid, PathBuf::from("/home/u/.phoenix-ide/prod.pid"));
        assert_eq!(p.log, PathBuf::from("/home/u/.phoenix-ide/prod.log"));
    }

    fn git(dir: &Path, args: &[&str]) {
        let st = std::process::Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .env("GIT_AUTHOR_NAME", "t")
            .env("GIT_AUTHOR_EMAIL", "t@example.com")
            .env("GIT_COMMITTER_NAME", "t")
            .env("GIT_COMMITTER_EMAIL", "t@example.com")
            .status()
            .expect("git");
        assert!(st.success(), "git {args:?}");
    }

    #[test]
    fn test_resolve_release_tag_and_head() {
        if which::which("git").is_err() {
            eprintln!("skipping: git not found");
            return;
        }
        let td = tempfile::tempdir().expect("tmpdir");
        let root = td.path();
        git(root, &["init", "-q"]);
        std::fs::write(root.join("a.txt"), "a").unwrap();
        git(root, &["add", "a.txt"]);
        git(root, &["commit", "-q", "-m", "init"]);

        let head = resolve_release(root, None).expect("head");
        assert!(!head.tagged);
        assert!(head.version.starts_with("dev-"), "{}", head.version);
        assert_eq!(head.version.len(), "dev-".len() + 8);

        match resolve_release(root, Some("v9.9.9")) {
            Err(DevError::Prerequisite { message, .. }) => assert!(message.contains("v9.9.9")),
            other => panic!("expected prerequisite error, got {other:?}"),
        }

        git(root, &["tag", "v1.0.0"]);
        let tagged = resolve_release(root, Some("v1.0.0")).expect("tag");
        assert_eq!(tagged.version, "v1.0.0");
        assert!(tagged.tagged);
        let exact = resolve_release(root, None).expect("head at tag");
        assert_eq!(exact.version, "v1.0.0");
    }
}
