//! Pre-deploy checks: configured commands run in order at the worktree root.
use std::path::Path;

use crate::util::{shell_join, Cmd, CommandRunner};
use crate::DevError;

/// Run every check; the first failing one stops the run and is returned as a build error.
///
/// Returns the number of checks that ran.
pub fn run_checks(
    runner: &CommandRunner,
    root: &Path,
    checks: &[Vec<String>],
    use_color: bool,
) -> Result<usize, DevError> {
    let mut ran = 0;
    for argv in checks {
        let Some((program, args)) = argv.split_first() else {
            continue;
        };
        let shown = shell_join(argv);
        crate::log_info_stderr(use_color, &format!("check: {shown}"));
        let out = runner.run(Cmd::new(program).args(args).cwd(root))?;
        ran += 1;
        if !out.status.success() {
            return Err(DevError::Build(format!("check failed: `{shown}`")));
        }
    }
    Ok(ran)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn test_stops_at_first_failure() {
        let td = tempfile::tempdir().expect("tmpdir");
        let marker = td.path().join("ran-third");
        let checks = vec![
            argv(&["true"]),
            argv(&["sh", "-c", "exit 1"]),
            argv(&["touch", marker.to_str().unwrap()]),
        ];
        match run_checks(&CommandRunner::new(), td.path(), &checks, false) {
            Err(DevError::Build(msg)) => assert!(msg.contains("sh -c 'exit 1'"), "{msg}"),
            other => panic!("expected build error, got {other:?}"),
        }
        assert!(!marker.exists());
    }

    #[test]
    fn test_empty_entries_are_skipped() {
        let td = tempfile::tempdir().expect("tmpdir");
        let checks = vec![vec![], argv(&["true"])];
        assert_eq!(
            run_checks(&CommandRunner::new(), td.path(), &checks, false).unwrap(),
            1
        );
    }
}
