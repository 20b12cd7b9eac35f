use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use devctl::deploy::build::{self, BuildSpec};
use devctl::lock::{self, DbLock};
use devctl::process::{self, SpawnSpec, StopBudget, StopOutcome};
use devctl::{gateway, health, DevError};

use super::DevContext;

fn build_spec(ctx: &DevContext) -> BuildSpec {
    BuildSpec {
        cargo_bin: ctx.config.cargo_bin.clone(),
        ui_dir: ctx.config.ui_dir.clone(),
        target: None,
        cc: None,
    }
}

fn pid_file(ctx: &DevContext) -> PathBuf {
    ctx.path(&ctx.config.dev.pid_file)
}

fn ui_pid_file(ctx: &DevContext) -> PathBuf {
    ctx.path(&ctx.config.dev.ui_pid_file)
}

/// Release build of the backend, with UI assets built first if they were never built.
fn build_backend(ctx: &DevContext) -> Result<(), DevError> {
    ctx.info("building backend (release)");
    build::ensure_ui_dist(&ctx.runner, &ctx.path(&ctx.config.ui_dir))?;
    build::build_step(
        &ctx.runner,
        build::cargo_release_cmd(&ctx.root, &build_spec(ctx), false),
    )
}

fn service_spec(ctx: &DevContext, port: u16) -> SpawnSpec {
    let mut spec = SpawnSpec::new(build_spec(ctx).binary_path(&ctx.root));
    spec.cwd = Some(ctx.root.clone());
    spec.env = vec![
        ("PHOENIX_PORT".to_string(), port.to_string()),
        (
            "PHOENIX_DB_PATH".to_string(),
            ctx.identity.db_path.display().to_string(),
        ),
    ];
    if env::var_os("RUST_LOG").is_none() {
        spec.env
            .push(("RUST_LOG".to_string(), ctx.config.dev.rust_log.clone()));
    }
    if let Some(gw) = gateway::discover(&ctx.config.gateway) {
        tracing::debug!(gateway = %gw, "dev service uses gateway");
        spec.env.push(("LLM_GATEWAY".to_string(), gw));
    }
    spec.log_file = Some(ctx.path(&ctx.config.dev.log_file));
    spec
}

fn ui_spec(ctx: &DevContext, api_port: u16, ui_port: u16) -> SpawnSpec {
    let mut spec = SpawnSpec::new("npm");
    spec.args = vec![
        "run".into(),
        "dev".into(),
        "--".into(),
        "--port".into(),
        ui_port.to_string(),
        "--strictPort".into(),
        "--host".into(),
        "0.0.0.0".into(),
    ];
    spec.env = vec![("VITE_API_PORT".to_string(), api_port.to_string())];
    spec.cwd = Some(ctx.path(&ctx.config.ui_dir));
    spec.log_file = Some(ctx.path(&ctx.config.dev.ui_log_file));
    spec
}

/// Acquire the worktree lock, then start the service holding it.
fn start_service(ctx: &DevContext, port: u16, no_build: bool) -> Result<i32, DevError> {
    fs::create_dir_all(&ctx.data_dir)?;
    let lock = lock::acquire_scoped(&ctx.identity.lock_path)?;
    if !no_build {
        build_backend(ctx)?;
    }
    let pid = process::start(&service_spec(ctx, port), &pid_file(ctx), Some(lock))?;
    ctx.ok(&format!("service started (pid {pid}) on port {port}"));
    Ok(pid)
}

fn start_ui(ctx: &DevContext, api_port: u16, ui_port: u16) {
    let ui_dir = ctx.path(&ctx.config.ui_dir);
    if !ui_dir.join("package.json").is_file() {
        tracing::debug!(dir = %ui_dir.display(), "no UI package; dev server not started");
        return;
    }
    if let Some(pid) = process::current_pid(&ui_pid_file(ctx)) {
        ctx.info(&format!("UI dev server already running (pid {pid})"));
        return;
    }
    match process::start(&ui_spec(ctx, api_port, ui_port), &ui_pid_file(ctx), None) {
        Ok(pid) => ctx.ok(&format!("UI dev server started (pid {pid}) on port {ui_port}")),
        Err(e) => ctx.warn(&format!("UI dev server failed to start: {e}")),
    }
}

pub(crate) fn up(
    ctx: &DevContext,
    port: Option<u16>,
    ui_port: Option<u16>,
    no_build: bool,
    no_ui: bool,
) -> Result<(), DevError> {
    let port = port.unwrap_or(ctx.identity.primary_port);
    let ui_port = ui_port.unwrap_or(ctx.identity.secondary_port);
    match process::current_pid(&pid_file(ctx)) {
        Some(pid) => ctx.info(&format!("service already running (pid {pid})")),
        None => {
            start_service(ctx, port, no_build)?;
        }
    }
    if !no_ui {
        start_ui(ctx, port, ui_port);
    }
    println!("service: http://localhost:{port}");
    if !no_ui {
        println!("ui:      http://localhost:{ui_port}");
    }
    Ok(())
}

fn describe_stop(label: &str, outcome: StopOutcome) -> String {
    match outcome {
        StopOutcome::NotRunning => format!("{label}: not running"),
        StopOutcome::Stopped(pid) => format!("{label}: stopped (pid {pid})"),
        StopOutcome::Killed(pid) => format!("{label}: killed after grace period (pid {pid})"),
        StopOutcome::SignalFailed(pid, e) => format!("{label}: could not signal pid {pid}: {e}"),
    }
}

fn pid_list(pids: &[i32]) -> String {
    pids.iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Free the worktree lock after the service stopped, including copies held by detached
/// helpers the service left behind.
fn reclaim_leftover_lock(ctx: &DevContext) {
    let path = &ctx.identity.lock_path;
    match process::reclaim_lock(path, StopBudget::SHORT) {
        Ok(leaked) if leaked.is_empty() => {}
        Ok(leaked) => ctx.info(&format!(
            "stopped leftover process(es) holding the database lock: pid {}",
            pid_list(&leaked)
        )),
        Err(DevError::Contention { .. }) => {
            let holders = lock::holders(path);
            let who = if holders.is_empty() {
                "an unknown process".to_string()
            } else {
                format!("pid {}", pid_list(&holders))
            };
            ctx.warn(&format!(
                "database lock still held by {who}: {}",
                path.display()
            ));
        }
        Err(e) => ctx.warn(&format!("cannot inspect lock {}: {e}", path.display())),
    }
}

pub(crate) fn down(ctx: &DevContext) -> Result<(), DevError> {
    let ui = process::stop(&ui_pid_file(ctx), "ui", StopBudget::SHORT, None);
    ctx.info(&describe_stop("ui", ui));
    let svc = process::stop(&pid_file(ctx), "service", StopBudget::SHORT, None);
    ctx.info(&describe_stop("service", svc));
    reclaim_leftover_lock(ctx);
    Ok(())
}

pub(crate) fn restart(ctx: &DevContext, port: Option<u16>, no_build: bool) -> Result<(), DevError> {
    let port = port.unwrap_or(ctx.identity.primary_port);
    if !no_build {
        // Build before stopping so a broken build leaves the running service alone.
        build_backend(ctx)?;
    }
    let svc = process::stop(&pid_file(ctx), "service", StopBudget::SHORT, None);
    ctx.info(&describe_stop("service", svc));
    reclaim_leftover_lock(ctx);
    start_service(ctx, port, true)?;
    Ok(())
}

/// Whether the flock is actually held; a file nobody holds is removed.
fn lock_state(ctx: &DevContext) -> String {
    let path = &ctx.identity.lock_path;
    if !path.exists() {
        return "free".to_string();
    }
    let mut trial = DbLock::new(path);
    match trial.acquire() {
        Ok(true) => {
            trial.release();
            "free (leftover lock file removed)".to_string()
        }
        Ok(false) => {
            let holders = lock::holders(path);
            match (holders.is_empty(), lock::holder_pid(path)) {
                (false, _) => format!("held by pid {}", pid_list(&holders)),
                (true, Some(pid)) => format!("held (recorded pid {pid})"),
                (true, None) => "held".to_string(),
            }
        }
        Err(e) => format!("unknown ({e})"),
    }
}

pub(crate) fn status(ctx: &DevContext) -> Result<(), DevError> {
    let id = &ctx.identity;
    println!("worktree:     {}", ctx.root.display());
    println!("fingerprint:  {}", id.fingerprint);
    println!("port offset:  {}", id.port_offset);
    println!("service port: {}", id.primary_port);
    println!("ui port:      {}", id.secondary_port);
    println!("database:     {}", id.db_path.display());
    println!("lock file:    {}", id.lock_path.display());
    match process::current_pid(&pid_file(ctx)) {
        Some(pid) => {
            println!("service:      running (pid {pid})");
            let version = health::probe_version(id.primary_port, Duration::from_millis(500))
                .unwrap_or_else(|_| "unreachable".to_string());
            println!("version:      {version}");
        }
        None => println!("service:      stopped"),
    }
    match process::current_pid(&ui_pid_file(ctx)) {
        Some(pid) => println!("ui:           running (pid {pid})"),
        None => println!("ui:           stopped"),
    }
    println!("lock:         {}", lock_state(ctx));
    Ok(())
}

pub(crate) fn check(ctx: &DevContext) -> Result<(), DevError> {
    let ran = devctl::checks::run_checks(&ctx.runner, &ctx.root, &ctx.config.checks, ctx.use_err)?;
    ctx.ok(&format!("all {ran} checks passed"));
    Ok(())
}
