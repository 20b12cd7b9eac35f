use std::path::{Path, PathBuf};

use devctl::config::{self, Config};
use devctl::util::CommandRunner;
use devctl::{identity_with, DevError, WorktreeIdentity};

use crate::cli::{Cli, Command};

pub(crate) mod dev;
pub(crate) mod prod;
pub(crate) mod vm;

/// Everything a command needs about the worktree it runs in; built once per invocation.
pub(crate) struct DevContext {
    pub root: PathBuf,
    pub config: Config,
    pub data_dir: PathBuf,
    pub identity: WorktreeIdentity,
    pub runner: CommandRunner,
    pub use_err: bool,
    pub verbose: bool,
}

impl DevContext {
    pub fn load(cli: &Cli) -> Result<Self, DevError> {
        let root = config::resolve_root(cli.root.as_deref())?;
        let config = Config::load(&root)?;
        let data_dir = config::data_dir();
        let identity = identity_with(&root, &data_dir, &config.ports);
        tracing::debug!(
            root = %root.display(),
            fingerprint = %identity.fingerprint,
            "worktree context"
        );
        Ok(Self {
            root,
            config,
            data_dir,
            identity,
            runner: CommandRunner::new(),
            use_err: devctl::color_enabled_stderr(),
            verbose: cli.verbose,
        })
    }

    /// Resolve a configured path against the worktree root.
    pub fn path(&self, p: &Path) -> PathBuf {
        config::under_root(&self.root, p)
    }

    pub fn info(&self, msg: &str) {
        devctl::log_info_stderr(self.use_err, msg);
    }

    pub fn ok(&self, msg: &str) {
        devctl::log_ok_stderr(self.use_err, msg);
    }

    pub fn warn(&self, msg: &str) {
        devctl::log_warn_stderr(self.use_err, msg);
    }
}

pub(crate) fn dispatch(cli: &Cli) -> Result<(), DevError> {
    let ctx = DevContext::load(cli)?;
    match &cli.command {
        Command::Up {
            port,
            ui_port,
            no_build,
            no_ui,
        } => dev::up(&ctx, *port, *ui_port, *no_build, *no_ui),
        Command::Down => dev::down(&ctx),
        Command::Restart { port, no_build } => dev::restart(&ctx, *port, *no_build),
        Command::Status => dev::status(&ctx),
        Command::Check => dev::check(&ctx),
        Command::Doctor => {
            devctl::doctor::run_doctor(&ctx.root, &ctx.data_dir, &ctx.config, ctx.verbose);
            Ok(())
        }
        Command::Prod { cmd } => prod::run(&ctx, cmd),
        Command::Vm { cmd } => vm::run(&ctx, cmd),
    }
}
