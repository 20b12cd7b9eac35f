//! devctl: worktree-scoped development servers and socket-activated production deploys.
//!
//! Each worktree gets a stable identity (fingerprint, ports, database and lock paths), so
//! several checkouts can run side by side. Production deploys go to host systemd, to systemd
//! inside a Lima VM, or to a PID-file daemon, depending on what the host can do.

pub mod checks;
mod color;
pub mod config;
pub mod deploy;
pub mod detect;
pub mod doctor;
mod errors;
pub mod gateway;
pub mod health;
pub mod identity;
pub mod lock;
pub mod logging;
pub mod process;
pub mod units;
pub mod util;
pub mod vm;

pub use color::*;
pub use errors::*;
pub use identity::{identity, identity_with, PortPlan, WorktreeIdentity};
pub use lock::DbLock;
