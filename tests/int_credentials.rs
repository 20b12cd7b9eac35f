mod support;

use std::path::PathBuf;

use devctl as dc;
use dc::deploy::credentials::{self, CredentialSource};
use dc::units::CredentialDelivery;
use support::RecordingHost;

const ENV_FILE: &str = "/etc/phoenix-ide/env";

struct Fixed {
    gateway: Option<&'static str>,
    api_key: Option<&'static str>,
}

impl CredentialSource for Fixed {
    fn gateway(&self) -> Option<String> {
        self.gateway.map(str::to_string)
    }

    fn api_key(&self) -> Option<String> {
        self.api_key.map(str::to_string)
    }
}

/// A host whose credential file does not yet hold a gateway or key.
fn host_without_credentials() -> RecordingHost {
    let host = RecordingHost::default();
    host.fail_when("grep -qE");
    host
}

#[test]
fn int_native_prefers_inline_gateway() {
    let host = host_without_credentials();
    let source = Fixed {
        gateway: Some("http://127.0.0.1:8462"),
        api_key: Some("sk-test"),
    };
    let delivery = credentials::provision_native(&host, &source, ENV_FILE).expect("provision");
    assert_eq!(
        delivery,
        CredentialDelivery::InlineGateway("http://127.0.0.1:8462".to_string())
    );
    assert!(host.writes.borrow().is_empty(), "inline delivery writes no file");
    assert!(host.scripts().is_empty(), "{:?}", host.scripts());
}

#[test]
fn int_native_writes_key_file_when_no_gateway() {
    let host = host_without_credentials();
    let source = Fixed {
        gateway: None,
        api_key: Some("sk-test"),
    };
    let delivery = credentials::provision_native(&host, &source, ENV_FILE).expect("provision");
    assert_eq!(delivery, CredentialDelivery::ExternalFile(PathBuf::from(ENV_FILE)));
    let writes = host.writes.borrow();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].0, ENV_FILE);
    assert_eq!(writes[0].1, "ANTHROPIC_API_KEY=sk-test\n");
    assert_eq!(writes[0].2, Some(0o600));
}

#[test]
fn int_native_without_any_credentials_is_a_prerequisite() {
    let host = host_without_credentials();
    let source = Fixed {
        gateway: None,
        api_key: None,
    };
    match credentials::provision_native(&host, &source, ENV_FILE) {
        Err(dc::DevError::Prerequisite { remediation, .. }) => {
            assert!(remediation.iter().any(|r| r.contains("ANTHROPIC_API_KEY")))
        }
        other => panic!("expected prerequisite error, got {other:?}"),
    }
    assert!(host.writes.borrow().is_empty());
}

#[test]
fn int_isolated_rewrites_loopback_gateway_for_the_vm() {
    let host = host_without_credentials();
    let source = Fixed {
        gateway: Some("http://127.0.0.1:8462"),
        api_key: None,
    };
    let delivery = credentials::provision_isolated(&host, &source, ENV_FILE).expect("provision");
    assert_eq!(delivery, CredentialDelivery::ExternalFile(PathBuf::from(ENV_FILE)));
    let writes = host.writes.borrow();
    assert_eq!(writes.len(), 1);
    let (path, body, mode) = &writes[0];
    assert_eq!(path, ENV_FILE);
    assert_eq!(body, "LLM_GATEWAY=http://host.lima.internal:8462\n");
    assert_eq!(*mode, Some(0o600));
}

#[test]
fn int_isolated_env_file_is_written_once_then_reused() {
    let host = host_without_credentials();
    let source = Fixed {
        gateway: None,
        api_key: Some("sk-test"),
    };
    credentials::provision_isolated(&host, &source, ENV_FILE).expect("first deploy");
    assert_eq!(host.writes.borrow().len(), 1);

    // The file now holds a key line.
    host.failing.borrow_mut().clear();
    let again = credentials::provision_isolated(&host, &source, ENV_FILE).expect("second deploy");
    assert_eq!(again, CredentialDelivery::ExternalFile(PathBuf::from(ENV_FILE)));
    assert_eq!(host.writes.borrow().len(), 1, "existing credentials are not rewritten");
    let checks = host
        .scripts()
        .iter()
        .filter(|s| s.contains("grep -qE") && s.contains(ENV_FILE))
        .count();
    assert_eq!(checks, 2);
}
