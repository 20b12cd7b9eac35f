//! Application-level probe against the service's version endpoint.
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

pub const VERSION_PATH: &str = "/version";

pub fn version_url(port: u16) -> String {
    format!("http://127.0.0.1:{port}{VERSION_PATH}")
}

/// GET the version endpoint; the body (plain text or JSON) is returned trimmed.
pub fn probe_version(port: u16, timeout: Duration) -> Result<String> {
    let url = version_url(port);
    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .context("cannot build http client")?;
    let resp = client
        .get(&url)
        .send()
        .with_context(|| format!("GET {url}"))?;
    let status = resp.status();
    if !status.is_success() {
        return Err(anyhow!("GET {url} returned {status}"));
    }
    let body = resp.text().context("reading version body")?;
    Ok(extract_version(&body))
}

/// Accept either `{"version": "..."}` or a bare string.
pub fn extract_version(body: &str) -> String {
    let trimmed = body.trim();
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(s) = v.get("version").and_then(|x| x.as_str()) {
            return s.to_string();
        }
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    #[test]
    fn test_extract_version_forms() {
        assert_eq!(extract_version("dev-1a2b3c4d\n"), "dev-1a2b3c4d");
        assert_eq!(extract_version(r#"{"version":"v0.9.1","commit":"x"}"#), "v0.9.1");
        assert_eq!(extract_version(r#"{"other":1}"#), r#"{"other":1}"#);
    }

    #[test]
    fn test_probe_version_against_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = s.read(&mut buf);
            let body = "v1.0.0";
            let resp = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            s.write_all(resp.as_bytes()).unwrap();
        });
        let v = probe_version(port, Duration::from_secs(2)).expect("probe");
        assert_eq!(v, "v1.0.0");
        server.join().unwrap();
    }
}
