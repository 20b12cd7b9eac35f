use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "devctl",
    version,
    about = "Worktree-scoped dev servers and socket-activated production deploys."
)]
pub(crate) struct Cli {
    /// Print debug diagnostics
    #[arg(long, global = true)]
    pub verbose: bool,

    /// Colorize output: auto|always|never
    #[arg(long = "color", value_enum, global = true)]
    pub color: Option<devctl::ColorMode>,

    /// Worktree root (default: current directory)
    #[arg(long = "root", global = true)]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub(crate) enum Command {
    /// Build and start the dev service and UI dev server on this worktree's ports
    Up {
        /// Override the derived service port
        #[arg(long)]
        port: Option<u16>,
        /// Override the derived UI dev server port
        #[arg(long = "ui-port")]
        ui_port: Option<u16>,
        /// Start the existing binary without building
        #[arg(long = "no-build")]
        no_build: bool,
        /// Do not start the UI dev server
        #[arg(long = "no-ui")]
        no_ui: bool,
    },
    /// Stop the UI dev server and the dev service; release the database lock
    Down,
    /// Rebuild and restart the dev service (UI dev server untouched)
    Restart {
        /// Override the derived service port
        #[arg(long)]
        port: Option<u16>,
        /// Restart the existing binary without building
        #[arg(long = "no-build")]
        no_build: bool,
    },
    /// Show this worktree's identity and the state of its processes
    Status,
    /// Run the configured pre-deploy checks
    Check,
    /// Diagnose host capabilities and configuration
    Doctor,
    /// Production build and deployment
    Prod {
        #[command(subcommand)]
        cmd: ProdCmd,
    },
    /// Lima VM used as the isolated deployment environment
    Vm {
        #[command(subcommand)]
        cmd: VmCmd,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub(crate) enum ProdCmd {
    /// Build the production artifact only
    Build {
        /// Tag to build (default: current HEAD)
        tag: Option<String>,
        /// Keep debug symbols
        #[arg(long)]
        debug: bool,
    },
    /// Build, install and activate on the detected target
    Deploy {
        /// Tag to deploy (default: current HEAD)
        tag: Option<String>,
        /// Keep debug symbols
        #[arg(long)]
        debug: bool,
        /// Skip the pre-deploy checks
        #[arg(long = "skip-checks")]
        skip_checks: bool,
    },
    /// Show production service state
    Status,
    /// Stop the production service
    Stop,
    /// Set an environment override and restart the service
    Set {
        name: String,
        value: String,
    },
    /// Remove an environment override and restart the service
    Unset {
        name: String,
    },
    /// List environment overrides
    Overrides,
}

#[derive(Subcommand, Debug, Clone)]
pub(crate) enum VmCmd {
    /// Create and start the VM from the repository template
    Create,
    /// Open a shell in the VM
    Shell,
    /// Stop the service in the VM and delete the VM
    Destroy {
        /// Do not ask for confirmation
        #[arg(long)]
        yes: bool,
    },
}
