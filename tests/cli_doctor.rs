use std::process::Command;

#[test]
fn cli_doctor_exits_zero() {
    let root = tempfile::tempdir().expect("tmp root");
    let data = tempfile::tempdir().expect("tmp data");
    let out = Command::new(env!("CARGO_BIN_EXE_devctl"))
        .arg("doctor")
        .arg("--root")
        .arg(root.path())
        .env("DEVCTL_DATA_DIR", data.path())
        .env("NO_COLOR", "1")
        .output()
        .expect("failed to run devctl doctor");
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(
        out.status.success(),
        "devctl doctor exited non-zero: {:?}\nstderr:\n{}",
        out.status.code(),
        stderr
    );
    assert!(stderr.contains("devctl doctor"), "{stderr}");
    assert!(stderr.contains("fingerprint:"), "{stderr}");
    assert!(stderr.contains("doctor: completed diagnostics."), "{stderr}");
}

#[test]
fn cli_version_flag() {
    let out = Command::new(env!("CARGO_BIN_EXE_devctl"))
        .arg("--version")
        .output()
        .expect("failed to run devctl --version");
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).contains(env!("CARGO_PKG_VERSION")));
}
