use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

/// Advisory, process-exclusive lock on a worktree's database lock file.
///
/// Holds at most one open descriptor. The PID written into the file is for humans only;
/// exclusion comes from `flock`. Dropping the handle releases the lock.
#[derive(Debug)]
pub struct DbLock {
    path: PathBuf,
    file: Option<File>,
}

impl DbLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Try to take the lock without blocking.
    ///
    /// Returns Ok(false) when another holder owns it; Err only for IO failures such as an
    /// unwritable data directory.
    pub fn acquire(&mut self) -> io::Result<bool> {
        if self.file.is_some() {
            return Ok(true);
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut f = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)?;
        match f.try_lock_exclusive() {
            Ok(()) => {
                f.set_len(0)?;
                f.seek(SeekFrom::Start(0))?;
                writeln!(f, "{}", std::process::id())?;
                tracing::debug!(path = %self.path.display(), "database lock acquired");
                self.file = Some(f);
                Ok(true)
            }
            Err(e) if is_contention(&e) => {
                tracing::debug!(path = %self.path.display(), "database lock held elsewhere");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Unlock, close, and best-effort delete the lock file. Safe to call repeatedly.
    pub fn release(&mut self) {
        if let Some(f) = self.file.take() {
            let _ = f.unlock();
            drop(f);
            // Another process may already be racing to recreate it.
            let _ = fs::remove_file(&self.path);
            tracing::debug!(path = %self.path.display(), "database lock released");
        }
    }

    /// Replace the diagnostic PID, e.g. with the child that is about to inherit the lock.
    pub fn record_holder(&mut self, pid: i32) -> io::Result<()> {
        if let Some(f) = self.file.as_mut() {
            f.set_len(0)?;
            f.seek(SeekFrom::Start(0))?;
            writeln!(f, "{pid}")?;
        }
        Ok(())
    }

    /// Descriptor a spawned child should keep across exec to share the lock.
    ///
    /// flock locks belong to the open file description, so any process holding a copy keeps the
    /// database locked for as long as it lives, including whatever it forks.
    pub fn inheritable_fd(&self) -> Option<RawFd> {
        self.file.as_ref().map(|f| f.as_raw_fd())
    }

    /// Close this process's descriptor without unlocking: the lock stays with the child that
    /// inherited it and disappears when that child exits.
    pub fn hand_off(mut self) {
        if let Some(f) = self.file.take() {
            drop(f);
        }
    }
}

impl Drop for DbLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn is_contention(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Acquire `path` for the duration of the returned guard.
///
/// Contention is reported as `DevError::Contention` naming the lock file.
pub fn acquire_scoped(path: &Path) -> Result<DbLock, crate::DevError> {
    let mut lock = DbLock::new(path);
    if lock.acquire()? {
        Ok(lock)
    } else {
        Err(crate::DevError::Contention {
            lock_path: path.to_path_buf(),
        })
    }
}

/// Read the diagnostic PID written by the current holder, if any.
pub fn holder_pid(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Other processes with `path` open, found through `/proc/<pid>/fd`.
///
/// Empty when `/proc` is unavailable or the file does not exist.
pub fn holders(path: &Path) -> Vec<i32> {
    let Ok(target) = fs::canonicalize(path) else {
        return Vec::new();
    };
    let Ok(procs) = fs::read_dir("/proc") else {
        return Vec::new();
    };
    let me = std::process::id() as i32;
    let mut out: Vec<i32> = procs
        .flatten()
        .filter_map(|e| e.file_name().to_str()?.parse::<i32>().ok())
        .filter(|&pid| pid != me)
        .filter(|pid| {
            fs::read_dir(format!("/proc/{pid}/fd"))
                .map(|fds| {
                    fds.flatten()
                        .any(|fd| fs::read_link(fd.path()).is_ok_and(|l| l == target))
                })
                .unwrap_or(false)
        })
        .collect();
    out.sort_unstable();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_fails_and_first_survives() {
        let td = tempfile::tempdir().expect("tmpdir");
        let p = td.path().join("db.lock");
        let mut first = DbLock::new(&p);
        assert!(first.acquire().expect("acquire"));
        let mut second = DbLock::new(&p);
        assert!(!second.acquire().expect("second acquire"));
        assert!(!second.is_held());
        assert!(first.is_held());
        assert_eq!(holder_pid(&p), Some(std::process::id() as i32));
    }

    #[test]
    fn test_release_removes_file_and_allows_reacquire() {
        let td = tempfile::tempdir().expect("tmpdir");
        let p = td.path().join("nested").join("db.lock");
        let mut first = DbLock::new(&p);
        assert!(first.acquire().expect("acquire"));
        first.release();
        first.release();
        assert!(!p.exists());
        let mut second = DbLock::new(&p);
        assert!(second.acquire().expect("reacquire"));
    }

    #[test]
    fn test_scoped_guard_releases_on_drop() {
        let td = tempfile::tempdir().expect("tmpdir");
        let p = td.path().join("db.lock");
        {
            let _g = acquire_scoped(&p).expect("scoped");
            match acquire_scoped(&p) {
                Err(crate::DevError::Contention { lock_path }) => assert_eq!(lock_path, p),
                other => panic!("expected contention, got {other:?}"),
            }
        }
        assert!(acquire_scoped(&p).is_ok());
    }

    #[test]
    fn test_scoped_guard_releases_on_panic() {
        let td = tempfile::tempdir().expect("tmpdir");
        let p = td.path().join("db.lock");
        let p2 = p.clone();
        let r = std::panic::catch_unwind(move || {
            let _g = acquire_scoped(&p2).expect("scoped");
            panic!("boom");
        });
        assert!(r.is_err());
        assert!(acquire_scoped(&p).is_ok());
    }

    #[test]
    fn test_holders_skip_this_process() {
        let td = tempfile::tempdir().expect("tmpdir");
        let p = td.path().join("db.lock");
        let _g = acquire_scoped(&p).expect("scoped");
        assert!(holders(&p).is_empty());
        assert!(holders(&td.path().join("absent.lock")).is_empty());
    }
}
