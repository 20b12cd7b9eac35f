//! Diagnostic logging setup.
//!
//! Filter comes from `DEVCTL_LOG` (EnvFilter syntax), defaulting to `warn`; `--verbose` turns
//! on debug output for this crate. Output goes to stderr without timestamps so it interleaves
//! cleanly with the progress lines.
use std::env;

use once_cell::sync::OnceCell;
use tracing_subscriber::prelude::*;

pub const LOG_ENV: &str = "DEVCTL_LOG";

static INIT: OnceCell<()> = OnceCell::new();

/// Effective filter directive for the given verbosity and environment value.
pub fn filter_directive(verbose: bool, env_value: Option<&str>) -> String {
    let base = env_value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("warn")
        .to_string();
    if verbose {
        format!("{base},devctl=debug")
    } else {
        base
    }
}

/// Install the global subscriber once; later calls are ignored.
pub fn init(verbose: bool) {
    if INIT.get().is_some() {
        return;
    }
    let directive = filter_directive(verbose, env::var(LOG_ENV).ok().as_deref());
    let env_filter = tracing_subscriber::EnvFilter::try_new(&directive)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(crate::color_enabled_stderr())
        .without_time()
        .with_target(verbose);
    if tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .is_err()
    {
        eprintln!("devctl: logging init skipped (global subscriber already set)");
    }
    let _ = INIT.set(());
}
