mod support;

use std::path::PathBuf;

use devctl as dc;
use dc::deploy::{Activation, Artifact, SystemdInstaller, VerifyBudget};
use dc::units::{CredentialDelivery, UnitConfig};
use support::RecordingHost;

fn units() -> UnitConfig {
    UnitConfig {
        service_name: "phoenix-ide".to_string(),
        user: "phoenix".to_string(),
        data_path: PathBuf::from("/var/lib/phoenix/prod.db"),
        install_dir: PathBuf::from("/opt/phoenix-ide"),
        port: 8031,
        credentials: CredentialDelivery::InlineGateway("http://127.0.0.1:8462".to_string()),
    }
}

fn artifact() -> Artifact {
    Artifact {
        path: "/build/target/release/phoenix_ide".to_string(),
    }
}

#[test]
fn int_running_service_is_reloaded_without_touching_the_socket() {
    let host = RecordingHost::with_states(&["active"]);
    let installer = SystemdInstaller::new(&host, units()).with_budget(VerifyBudget::IMMEDIATE);

    let activation = installer.install(&artifact(), "v1.4.0").expect("install");
    assert_eq!(activation, Activation::Reloaded);
    installer.verify().expect("verify");

    let scripts = host.scripts();
    assert!(
        host.position("systemctl reload phoenix-ide.service").is_some(),
        "{scripts:#?}"
    );
    assert!(
        host.position("systemctl start").is_none(),
        "nothing may be started on the reload path: {scripts:#?}"
    );
    assert!(host.position("systemctl restart").is_none(), "{scripts:#?}");
}

#[test]
fn int_stopped_service_starts_socket_before_service() {
    let host = RecordingHost::with_states(&["inactive", "active"]);
    let installer = SystemdInstaller::new(&host, units()).with_budget(VerifyBudget::IMMEDIATE);

    let activation = installer.install(&artifact(), "v1.4.0").expect("install");
    assert_eq!(activation, Activation::Started);
    installer.verify().expect("verify");

    let socket = host
        .position("systemctl start phoenix-ide.socket")
        .expect("socket started");
    let service = host
        .position("systemctl start phoenix-ide.service")
        .expect("service started");
    assert!(socket < service, "{:#?}", host.scripts());
}

#[test]
fn int_binary_is_staged_and_units_written_before_reload() {
    let host = RecordingHost::with_states(&["inactive", "active"]);
    let installer = SystemdInstaller::new(&host, units()).with_budget(VerifyBudget::IMMEDIATE);
    installer.install(&artifact(), "v2.0.0").expect("install");

    let stage = host.position("install -D -m 0755").expect("staged");
    let reload = host.position("systemctl daemon-reload").expect("daemon-reload");
    let enable = host.position("systemctl enable").expect("enable");
    assert!(stage < reload && reload < enable, "{:#?}", host.scripts());

    let staged = &host.scripts()[stage];
    assert!(
        staged.contains("/opt/phoenix-ide/phoenix-ide.new")
            && staged.contains("mv -f /opt/phoenix-ide/phoenix-ide.new /opt/phoenix-ide/phoenix-ide"),
        "{staged}"
    );

    let writes = host.writes.borrow();
    let paths: Vec<&str> = writes.iter().map(|(p, _, _)| p.as_str()).collect();
    assert_eq!(
        paths,
        vec![
            "/etc/systemd/system/phoenix-ide.socket",
            "/etc/systemd/system/phoenix-ide.service"
        ]
    );
    assert!(writes.iter().all(|(_, _, mode)| *mode == Some(0o644)));
    assert!(writes[1].1.contains("Environment=PHOENIX_VERSION=v2.0.0"));
}

#[test]
fn int_failed_activation_carries_journal_tail() {
    let mut host = RecordingHost::with_states(&["inactive", "failed"]);
    host.journal = "line one\npanicked at 'bind: address in use'\n".to_string();
    let installer = SystemdInstaller::new(&host, units())
        .with_budget(VerifyBudget::IMMEDIATE)
        .with_journal_lines(5);

    installer.install(&artifact(), "v1.4.0").expect("install");
    match installer.verify() {
        Err(dc::DevError::Activation { unit, log_tail }) => {
            assert_eq!(unit, "phoenix-ide.service");
            assert!(log_tail.contains("address in use"), "{log_tail}");
        }
        other => panic!("expected activation failure, got {other:?}"),
    }
    assert!(host
        .position("journalctl -u phoenix-ide.service -n 5 --no-pager")
        .is_some());
}

#[test]
fn int_stop_takes_down_service_and_socket() {
    let host = RecordingHost::default();
    let installer = SystemdInstaller::new(&host, units());
    installer.stop().expect("stop");
    assert!(host
        .position("systemctl stop phoenix-ide.service phoenix-ide.socket")
        .is_some());
}
