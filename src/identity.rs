//! Worktree identity: a stable fingerprint of the source-tree path and everything derived from it.
//!
//! Nothing here touches the filesystem. Callers canonicalize the worktree root once and pass the
//! absolute path; the same path string always yields the same identity.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const BASE_PRIMARY_PORT: u16 = 8000;
pub const BASE_SECONDARY_PORT: u16 = 8025;
pub const PORT_RANGE: u16 = 25;

/// Port allocation for the two per-worktree services.
///
/// The primary range is `[base_primary, base_primary + range)` and the secondary range is
/// `[base_secondary, base_secondary + range)`; the ranges must not overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortPlan {
    pub base_primary: u16,
    pub base_secondary: u16,
    pub range: u16,
}

impl Default for PortPlan {
    fn default() -> Self {
        Self {
            base_primary: BASE_PRIMARY_PORT,
            base_secondary: BASE_SECONDARY_PORT,
            range: PORT_RANGE,
        }
    }
}

impl PortPlan {
    pub fn validate(&self) -> Result<(), String> {
        if self.range == 0 {
            return Err("port range must be at least 1".to_string());
        }
        let (lo, hi) = if self.base_primary <= self.base_secondary {
            (self.base_primary, self.base_secondary)
        } else {
            (self.base_secondary, self.base_primary)
        };
        if u32::from(lo) + u32::from(self.range) > u32::from(hi) {
            return Err(format!(
                "port ranges overlap: {}+{} and {}+{}",
                self.base_primary, self.range, self.base_secondary, self.range
            ));
        }
        if u32::from(hi) + u32::from(self.range) > u32::from(u16::MAX) + 1 {
            return Err("port range exceeds 65535".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeIdentity {
    pub root: PathBuf,
    /// 8 lowercase hex characters.
    pub fingerprint: String,
    pub port_offset: u16,
    pub primary_port: u16,
    pub secondary_port: u16,
    pub db_path: PathBuf,
    pub lock_path: PathBuf,
}

/// Derive the identity of the worktree at `root` with the default port plan.
pub fn identity(root: &Path, data_dir: &Path) -> WorktreeIdentity {
    identity_with(root, data_dir, &PortPlan::default())
}

pub fn identity_with(root: &Path, data_dir: &Path, plan: &PortPlan) -> WorktreeIdentity {
    let key = root.to_string_lossy();
    let hash = fnv1a64(key.as_bytes());
    let fingerprint = format!("{:016x}", hash)[..8].to_string();
    let range = u64::from(plan.range.max(1));
    let port_offset = (hash % range) as u16;
    WorktreeIdentity {
        root: root.to_path_buf(),
        db_path: data_dir.join(format!("phoenix-{fingerprint}.db")),
        lock_path: data_dir.join(format!("phoenix-{fingerprint}.lock")),
        primary_port: plan.base_primary + port_offset,
        secondary_port: plan.base_secondary + port_offset,
        port_offset,
        fingerprint,
    }
}

/// Stable 64-bit FNV-1a hash.
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 1099511628211;
    let mut h: u64 = FNV_OFFSET;
    for b in bytes {
        h ^= *b as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv_known_vectors() {
        assert_eq!(fnv1a64(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a64(b"a"), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn test_identity_is_stable_and_namespaced() {
        let data = Path::new("/home/dev/.phoenix-ide");
        let a = identity(Path::new("/src/wt-one"), data);
        let b = identity(Path::new("/src/wt-one"), data);
        assert_eq!(a, b);
        assert_eq!(a.fingerprint.len(), 8);
        assert!(a
            .db_path
            .ends_with(format!("phoenix-{}.db", a.fingerprint)));
        assert!(a
            .lock_path
            .ends_with(format!("phoenix-{}.lock", a.fingerprint)));
        assert_eq!(a.primary_port, BASE_PRIMARY_PORT + a.port_offset);
        assert_eq!(a.secondary_port, BASE_SECONDARY_PORT + a.port_offset);
    }

    #[test]
    fn test_ports_stay_in_disjoint_ranges() {
        let data = Path::new("/d");
        for i in 0..200 {
            let id = identity(Path::new(&format!("/w/tree-{i}")), data);
            assert!(id.port_offset < PORT_RANGE);
            assert!((8000..8025).contains(&id.primary_port));
            assert!((8025..8050).contains(&id.secondary_port));
        }
    }

    #[test]
    fn test_port_plan_validate() {
        assert!(PortPlan::default().validate().is_ok());
        let overlap = PortPlan {
            base_primary: 8000,
            base_secondary: 8010,
            range: 25,
        };
        assert!(overlap.validate().is_err());
        let zero = PortPlan {
            range: 0,
            ..PortPlan::default()
        };
        assert!(zero.validate().is_err());
    }
}
