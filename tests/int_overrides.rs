mod support;

use devctl as dc;
use dc::deploy::overrides;
use support::RecordingHost;

#[test]
fn int_set_writes_fragment_then_reloads_and_restarts() {
    let host = RecordingHost::default();
    overrides::set(&host, "phoenix-ide", "RUST_LOG", "debug tower=info").expect("set");

    let writes = host.writes.borrow();
    assert_eq!(writes.len(), 1);
    let (path, content, mode) = &writes[0];
    assert_eq!(path, "/etc/systemd/system/phoenix-ide.service.d/RUST_LOG.conf");
    assert!(content.contains("[Service]"), "{content}");
    assert!(
        content.contains("Environment=\"RUST_LOG=debug tower=info\""),
        "{content}"
    );
    assert_eq!(*mode, Some(0o644));

    let reload = host.position("systemctl daemon-reload").expect("reload");
    let restart = host
        .position("systemctl restart phoenix-ide.service")
        .expect("restart");
    assert!(reload < restart);
}

#[test]
fn int_set_removes_conflicting_fragment() {
    let host = RecordingHost::default();
    *host.listing.borrow_mut() =
        "/etc/systemd/system/phoenix-ide.service.d/legacy.conf:Environment=RUST_LOG=info\n"
            .to_string();
    overrides::set(&host, "phoenix-ide", "RUST_LOG", "debug").expect("set");
    assert!(host
        .position("rm -f /etc/systemd/system/phoenix-ide.service.d/legacy.conf")
        .is_some());
}

#[test]
fn int_unset_missing_variable_changes_nothing() {
    let host = RecordingHost::default();
    let removed = overrides::unset(&host, "phoenix-ide", "NOT_SET").expect("unset");
    assert!(!removed);
    assert!(host.position("systemctl").is_none(), "{:#?}", host.scripts());
}

#[test]
fn int_invalid_name_is_rejected_before_any_host_call() {
    let host = RecordingHost::default();
    assert!(overrides::set(&host, "phoenix-ide", "BAD-NAME", "x").is_err());
    assert!(overrides::set(&host, "phoenix-ide", "OK", "two\nlines").is_err());
    assert!(host.scripts().is_empty());
    assert!(host.writes.borrow().is_empty());
}
