//! PID-file supervised processes: liveness, stale-file reclamation, detached start, and
//! graceful-then-forceful stop.
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::{getpgid, setsid, Pid};

use crate::lock::{self, DbLock};

/// Delay between spawn and the first liveness check.
pub const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// How long `stop` waits for a graceful exit before SIGKILL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopBudget {
    pub attempts: u32,
    pub interval: Duration,
}

impl StopBudget {
    /// 10 polls over ~1s; dev servers.
    pub const SHORT: StopBudget = StopBudget {
        attempts: 10,
        interval: Duration::from_millis(100),
    };
    /// 10 polls over ~5s; production daemons that drain connections.
    pub const DRAIN: StopBudget = StopBudget {
        attempts: 10,
        interval: Duration::from_millis(500),
    };

    pub fn total(&self) -> Duration {
        self.interval * self.attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    /// Exited within the grace budget after SIGTERM.
    Stopped(i32),
    /// Survived the grace budget and was sent SIGKILL.
    Killed(i32),
    /// Signalling failed (e.g. EPERM); the PID file was removed anyway.
    SignalFailed(i32, Errno),
}

impl StopOutcome {
    pub fn was_running(&self) -> bool {
        !matches!(self, StopOutcome::NotRunning)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Stopped,
    Running(i32),
}

/// Signal-0 probe. Permission denied means the process exists but belongs to someone else.
///
/// If `pid` is an exited child of this process it is reaped first, so a zombie never counts
/// as alive.
pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    let target = Pid::from_raw(pid);
    // ECHILD for anything that is not our child; ignored.
    let _ = waitpid(target, Some(WaitPidFlag::WNOHANG));
    match kill(target, None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            tracing::debug!(pid, error = %e, "liveness probe failed; treating as not alive");
            false
        }
    }
}

pub fn read_pid_file(pid_file: &Path) -> Option<i32> {
    fs::read_to_string(pid_file).ok()?.trim().parse().ok()
}

/// PID recorded in `pid_file` if that process is alive.
///
/// A file naming a dead process, or holding garbage, is deleted and reported as absent.
pub fn current_pid(pid_file: &Path) -> Option<i32> {
    if !pid_file.exists() {
        return None;
    }
    match read_pid_file(pid_file) {
        Some(pid) if is_alive(pid) => Some(pid),
        stale => {
            tracing::debug!(pid_file = %pid_file.display(), pid = ?stale, "removing stale pid file");
            let _ = fs::remove_file(pid_file);
            None
        }
    }
}

pub fn state(pid_file: &Path) -> ProcessState {
    match current_pid(pid_file) {
        Some(pid) => ProcessState::Running(pid),
        None => ProcessState::Stopped,
    }
}

/// SIGTERM, poll, escalate to SIGKILL after the budget; the PID file is always removed and
/// `lock`, when given, is always released.
pub fn stop(pid_file: &Path, label: &str, budget: StopBudget, lock: Option<&mut DbLock>) -> StopOutcome {
    let outcome = match current_pid(pid_file) {
        None => StopOutcome::NotRunning,
        Some(pid) => terminate(pid, label, budget),
    };
    if pid_file.exists() {
        let _ = fs::remove_file(pid_file);
    }
    if let Some(l) = lock {
        l.release();
    }
    outcome
}

/// Terminate a known PID with the graceful-then-forceful protocol.
///
/// A process that leads its own process group (everything `start` spawns) is signalled as a
/// group, so helpers it forked (e.g. the server under `npm run dev`) go down with it.
pub fn terminate(pid: i32, label: &str, budget: StopBudget) -> StopOutcome {
    let target = signal_target(pid);
    if let Err(e) = kill(target, Signal::SIGTERM) {
        if e == Errno::ESRCH {
            return StopOutcome::Stopped(pid);
        }
        tracing::warn!(pid, label, error = %e, "could not signal process");
        return StopOutcome::SignalFailed(pid, e);
    }
    for _ in 0..budget.attempts {
        if !is_alive(pid) {
            tracing::debug!(pid, label, "stopped gracefully");
            return StopOutcome::Stopped(pid);
        }
        thread::sleep(budget.interval);
    }
    if !is_alive(pid) {
        return StopOutcome::Stopped(pid);
    }
    tracing::debug!(pid, label, "grace period elapsed; sending SIGKILL");
    match kill(target, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => return StopOutcome::SignalFailed(pid, e),
    }
    // SIGKILL is not ignorable; wait briefly so callers observe the exit.
    for _ in 0..20 {
        if !is_alive(pid) {
            break;
        }
        thread::sleep(Duration::from_millis(25));
    }
    StopOutcome::Killed(pid)
}

fn signal_target(pid: i32) -> Pid {
    let p = Pid::from_raw(pid);
    match getpgid(Some(p)) {
        Ok(group) if group == p => Pid::from_raw(-pid),
        _ => p,
    }
}

/// What to launch and where its output goes.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    /// Combined stdout+stderr destination, truncated on start; None discards output.
    pub log_file: Option<PathBuf>,
    pub settle: Duration,
}

impl SpawnSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            log_file: None,
            settle: SETTLE_DELAY,
        }
    }
}

#[derive(Debug)]
pub enum StartError {
    BinaryNotFound(PathBuf),
    /// The process died within the settle window.
    EarlyExit { log_file: Option<PathBuf> },
    Io(io::Error),
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartError::BinaryNotFound(p) => write!(f, "binary not found: {}", p.display()),
            StartError::EarlyExit { log_file: Some(l) } => {
                write!(f, "process exited during startup; check {}", l.display())
            }
            StartError::EarlyExit { log_file: None } => write!(f, "process exited during startup"),
            StartError::Io(e) => write!(f, "failed to start process: {e}"),
        }
    }
}

impl std::error::Error for StartError {}

impl From<io::Error> for StartError {
    fn from(e: io::Error) -> Self {
        StartError::Io(e)
    }
}

impl From<StartError> for crate::DevError {
    fn from(e: StartError) -> Self {
        match e {
            StartError::BinaryNotFound(_) => crate::DevError::NotFound(e.to_string()),
            StartError::Io(ioe) => crate::DevError::Io(ioe),
            other => crate::DevError::Other(anyhow::Error::new(other)),
        }
    }
}

/// Spawn `spec` in a new session, record its PID, and confirm it survives the settle delay.
///
/// When `lock` is given the child inherits the locked descriptor and keeps the lock after
/// this process exits. On failure the PID file is removed, the lock released, and no child is
/// left running.
pub fn start(spec: &SpawnSpec, pid_file: &Path, lock: Option<DbLock>) -> Result<i32, StartError> {
    let program = resolve_program(&spec.program)?;

    let mut cmd = Command::new(&program);
    cmd.args(&spec.args).stdin(Stdio::null());
    for (k, v) in &spec.env {
        cmd.env(k, v);
    }
    if let Some(cwd) = spec.cwd.as_ref() {
        cmd.current_dir(cwd);
    }
    match spec.log_file.as_ref() {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let log = File::create(path)?;
            let log_err = log.try_clone()?;
            cmd.stdout(Stdio::from(log)).stderr(Stdio::from(log_err));
        }
        None => {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
    }
    let inherit = lock.as_ref().and_then(DbLock::inheritable_fd);
    // SAFETY: setsid and fcntl are async-signal-safe; the fcntl only touches the child's
    // descriptor table.
    unsafe {
        cmd.pre_exec(move || {
            setsid().map_err(io::Error::from)?;
            if let Some(fd) = inherit {
                fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty())).map_err(io::Error::from)?;
            }
            Ok(())
        });
    }

    if let Some(parent) = pid_file.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut pid_out = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(pid_file)?;

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            let _ = fs::remove_file(pid_file);
            return Err(e.into());
        }
    };
    let pid = child.id() as i32;
    if let Err(e) = io::Write::write_all(&mut pid_out, pid.to_string().as_bytes()) {
        tracing::warn!(pid, error = %e, "cannot record pid; killing child");
        let _ = kill(Pid::from_raw(-pid), Signal::SIGKILL);
        let _ = child.wait();
        let _ = fs::remove_file(pid_file);
        return Err(e.into());
    }
    drop(pid_out);
    // Not waited on: is_alive reaps it if it exits while we are still around.
    drop(child);
    tracing::debug!(pid, program = %program.display(), "spawned");

    thread::sleep(spec.settle);
    if !is_alive(pid) {
        let _ = fs::remove_file(pid_file);
        drop(lock);
        return Err(StartError::EarlyExit {
            log_file: spec.log_file.clone(),
        });
    }
    if let Some(mut l) = lock {
        if let Err(e) = l.record_holder(pid) {
            tracing::debug!(error = %e, "could not record lock holder");
        }
        l.hand_off();
    }
    Ok(pid)
}

/// Free `lock_path` once the service that held it is gone.
///
/// Detached helpers the service started keep an inherited copy of the locked descriptor;
/// each remaining holder is terminated with `budget`. Returns the PIDs that had to be
/// stopped, or `Contention` if the lock is still held afterwards.
pub fn reclaim_lock(lock_path: &Path, budget: StopBudget) -> Result<Vec<i32>, crate::DevError> {
    if !lock_path.exists() {
        return Ok(Vec::new());
    }
    let mut trial = DbLock::new(lock_path);
    if trial.acquire()? {
        trial.release();
        return Ok(Vec::new());
    }
    let leaked = lock::holders(lock_path);
    for &pid in &leaked {
        let outcome = terminate(pid, "lock holder", budget);
        tracing::info!(pid, ?outcome, lock = %lock_path.display(), "stopped leftover lock holder");
    }
    if trial.acquire()? {
        trial.release();
        Ok(leaked)
    } else {
        Err(crate::DevError::Contention {
            lock_path: lock_path.to_path_buf(),
        })
    }
}

fn resolve_program(program: &Path) -> Result<PathBuf, StartError> {
    if program.components().count() > 1 {
        if program.is_file() {
            return Ok(program.to_path_buf());
        }
        return Err(StartError::BinaryNotFound(program.to_path_buf()));
    }
    which::which(program).map_err(|_| StartError::BinaryNotFound(program.to_path_buf()))
}
