//! Local builds: the reusable build checkout, UI assets, and the backend binary.
use std::path::{Path, PathBuf};

use super::{Artifact, Release};
use crate::util::{Cmd, CommandRunner};
use crate::DevError;

/// How to build the backend in a given source directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSpec {
    pub cargo_bin: String,
    /// UI package directory relative to the source root.
    pub ui_dir: PathBuf,
    /// Cross target triple; None builds for the host.
    pub target: Option<String>,
    /// C compiler for the cross target, exported as `CC_<triple>`.
    pub cc: Option<String>,
}

impl BuildSpec {
    /// Path of the release binary under `src_root`.
    pub fn binary_path(&self, src_root: &Path) -> PathBuf {
        let mut p = src_root.join("target");
        if let Some(t) = &self.target {
            p.push(t);
        }
        p.join("release").join(&self.cargo_bin)
    }
}

/// `CC_x86_64_unknown_linux_musl` for `x86_64-unknown-linux-musl`.
pub fn cc_env_name(triple: &str) -> String {
    format!("CC_{}", triple.replace('-', "_"))
}

/// Run a build step with output streamed; a non-zero exit becomes `DevError::Build`.
pub fn build_step(runner: &CommandRunner, cmd: Cmd) -> Result<(), DevError> {
    let shown = cmd.display();
    let out = runner.run(cmd)?;
    if !out.status.success() {
        let code = out
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        return Err(DevError::Build(format!("`{shown}` exited with {code}")));
    }
    Ok(())
}

/// Check out `git_ref` into `build_dir`, a linked worktree of `root` reused across builds.
pub fn materialize(
    runner: &CommandRunner,
    root: &Path,
    build_dir: &Path,
    git_ref: &str,
) -> Result<(), DevError> {
    let git_root = || Cmd::new("git").arg("-C").arg(root);
    if !build_dir.exists() {
        // Drops registrations of build checkouts that were deleted by hand.
        let _ = runner.run(git_root().args(["worktree", "prune"]).quiet(true));
        tracing::info!(dir = %build_dir.display(), %git_ref, "creating build worktree");
        build_step(
            runner,
            git_root()
                .args(["worktree", "add", "--detach"])
                .arg(build_dir)
                .arg(git_ref),
        )?;
        return Ok(());
    }
    if !build_dir.join(".git").exists() {
        return Err(DevError::prerequisite(
            format!(
                "build location {} exists but is not a git checkout",
                build_dir.display()
            ),
            &["Remove it and deploy again"],
        ));
    }
    tracing::info!(dir = %build_dir.display(), %git_ref, "updating build worktree");
    build_step(
        runner,
        Cmd::new("git")
            .arg("-C")
            .arg(build_dir)
            .args(["checkout", "--force", "--detach", git_ref]),
    )
}

/// `npm ci` then `npm run build` in the UI package; a tree without one is skipped.
pub fn build_ui(runner: &CommandRunner, ui_dir: &Path) -> Result<(), DevError> {
    if !ui_dir.join("package.json").is_file() {
        tracing::debug!(dir = %ui_dir.display(), "no UI package; skipping UI build");
        return Ok(());
    }
    build_step(runner, Cmd::new("npm").arg("ci").cwd(ui_dir))?;
    build_step(runner, Cmd::new("npm").args(["run", "build"]).cwd(ui_dir))
}

/// Build UI assets only when `dist/` is missing (dev mode).
pub fn ensure_ui_dist(runner: &CommandRunner, ui_dir: &Path) -> Result<(), DevError> {
    if ui_dir.join("dist").is_dir() || !ui_dir.join("package.json").is_file() {
        return Ok(());
    }
    if !ui_dir.join("node_modules").is_dir() {
        build_step(runner, Cmd::new("npm").arg("ci").cwd(ui_dir))?;
    }
    build_step(runner, Cmd::new("npm").args(["run", "build"]).cwd(ui_dir))
}

pub fn cargo_release_cmd(src_root: &Path, spec: &BuildSpec, debug: bool) -> Cmd {
    let mut cmd = Cmd::new("cargo")
        .args(["build", "--release", "--bin", spec.cargo_bin.as_str()])
        .cwd(src_root);
    if let Some(t) = &spec.target {
        cmd = cmd.args(["--target", t.as_str()]);
        if let Some(cc) = &spec.cc {
            cmd = cmd.env(cc_env_name(t), cc);
        }
    }
    if debug {
        cmd = cmd.env("CARGO_PROFILE_RELEASE_DEBUG", "true");
    }
    cmd
}

/// Build the backend in `src_root`; the binary is stripped unless `debug`.
pub fn build_backend(
    runner: &CommandRunner,
    src_root: &Path,
    spec: &BuildSpec,
    debug: bool,
) -> Result<PathBuf, DevError> {
    build_step(runner, cargo_release_cmd(src_root, spec, debug))?;
    let bin = spec.binary_path(src_root);
    if !bin.is_file() {
        return Err(DevError::Build(format!(
            "expected binary not produced: {}",
            bin.display()
        )));
    }
    if !debug {
        build_step(runner, Cmd::new("strip").arg(&bin))?;
    }
    Ok(bin)
}

/// Materialize, build UI, build backend: the whole local build for one release.
pub fn local_build(
    runner: &CommandRunner,
    root: &Path,
    build_dir: &Path,
    spec: &BuildSpec,
    release: &Release,
    debug: bool,
) -> Result<Artifact, DevError> {
    materialize(runner, root, build_dir, &release.git_ref)?;
    build_ui(runner, &build_dir.join(&spec.ui_dir))?;
    let bin = build_backend(runner, build_dir, spec, debug)?;
    Ok(Artifact {
        path: bin.display().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn musl_spec() -> BuildSpec {
        BuildSpec {
            cargo_bin: "phoenix_ide".into(),
            ui_dir: PathBuf::from("ui"),
            target: Some("x86_64-unknown-linux-musl".into()),
            cc: Some("x86_64-linux-musl-gcc".into()),
        }
    }

    #[test]
    fn test_binary_path_includes_target_triple() {
        let spec = musl_spec();
        assert_eq!(
            spec.binary_path(Path::new("/b")),
            PathBuf::from("/b/target/x86_64-unknown-linux-musl/release/phoenix_ide")
        );
        let host = BuildSpec {
            target: None,
            cc: None,
            ..spec
        };
        assert_eq!(
            host.binary_path(Path::new("/b")),
            PathBuf::from("/b/target/release/phoenix_ide")
        );
    }

    #[test]
    fn test_cargo_cmd_exports_cross_cc() {
        let cmd = cargo_release_cmd(Path::new("/b"), &musl_spec(), false);
        assert_eq!(
            cmd.display(),
            "cargo build --release --bin phoenix_ide --target x86_64-unknown-linux-musl"
        );
        assert_eq!(cc_env_name("x86_64-unknown-linux-musl"), "CC_x86_64_unknown_linux_musl");
    }

    #[test]
    fn test_failed_step_is_build_error() {
        let runner = CommandRunner::new();
        match build_step(&runner, Cmd::new("sh").args(["-c", "exit 3"]).quiet(true)) {
            Err(DevError::Build(msg)) => assert!(msg.ends_with("exited with 3"), "{msg}"),
            other => panic!("expected build error, got {other:?}"),
        }
    }

    #[test]
    fn test_ui_build_skipped_without_package() {
        let td = tempfile::tempdir().expect("tmpdir");
        let runner = CommandRunner::new();
        assert!(build_ui(&runner, td.path()).is_ok());
        assert!(ensure_ui_dist(&runner, td.path()).is_ok());
    }
}
