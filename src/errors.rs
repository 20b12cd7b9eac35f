//! Error taxonomy for the orchestrator.
//!
//! - Contention and missing prerequisites are expected outcomes; they carry the remedial command.
//! - Build failures propagate the external toolchain's message verbatim.
//! - Activation failures carry the tail of the service log.
//! - Map NotFound (binary or tool missing) to exit code 127; all others to 1.
use std::fmt;
use std::io;
use std::path::PathBuf;

#[derive(Debug)]
pub enum DevError {
    /// Another instance owns the worktree's database lock.
    Contention { lock_path: PathBuf },
    /// Required host capability missing (init system, isolation layer, tool, credentials).
    Prerequisite {
        message: String,
        remediation: Vec<String>,
    },
    /// External build toolchain exited non-zero.
    Build(String),
    /// Service did not reach the active state within the verification window.
    Activation { unit: String, log_tail: String },
    /// A binary or tool that must exist was not found.
    NotFound(String),
    Io(io::Error),
    Other(anyhow::Error),
}

impl DevError {
    pub fn prerequisite(message: impl Into<String>, remediation: &[&str]) -> Self {
        DevError::Prerequisite {
            message: message.into(),
            remediation: remediation.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl fmt::Display for DevError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DevError::Contention { lock_path } => {
                writeln!(f, "database is locked by another process.")?;
                writeln!(f, "  Lock file: {}", lock_path.display())?;
                write!(f, "  Run 'devctl down' in the other instance first.")
            }
            DevError::Prerequisite {
                message,
                remediation,
            } => {
                write!(f, "{message}")?;
                if !remediation.is_empty() {
                    write!(f, "\n\nOptions:")?;
                    for r in remediation {
                        write!(f, "\n  - {r}")?;
                    }
                }
                Ok(())
            }
            DevError::Build(msg) => write!(f, "build failed: {msg}"),
            DevError::Activation { unit, log_tail } => {
                write!(f, "{unit} failed to become active")?;
                if !log_tail.trim().is_empty() {
                    write!(f, "\n--- last log lines ---\n{}", log_tail.trim_end())?;
                }
                Ok(())
            }
            DevError::NotFound(what) => write!(f, "{what}"),
            DevError::Io(e) => write!(f, "{e}"),
            DevError::Other(e) => write!(f, "{e:#}"),
        }
    }
}

impl std::error::Error for DevError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DevError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for DevError {
    fn from(e: io::Error) -> Self {
        DevError::Io(e)
    }
}

impl From<anyhow::Error> for DevError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast::<DevError>() {
            Ok(dev) => dev,
            Err(other) => DevError::Other(other),
        }
    }
}

/// Map an io::Error to a process exit code:
/// - 127 for NotFound (command not found)
/// - 1 for all other errors
pub fn exit_code_for_io_error(e: &io::Error) -> u8 {
    if e.kind() == io::ErrorKind::NotFound {
        127
    } else {
        1
    }
}

pub fn exit_code_for(e: &DevError) -> u8 {
    match e {
        DevError::NotFound(_) => 127,
        DevError::Io(ioe) => exit_code_for_io_error(ioe),
        _ => 1,
    }
}
