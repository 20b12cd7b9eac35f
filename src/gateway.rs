//! Model-gateway discovery for credential delivery.
//!
//! Candidates are probed in order with a short timeout; any HTTP response, including an
//! error status, counts as reachable.
use std::env;
use std::fs;
use std::time::Duration;

use url::Url;

use crate::config::GatewayConfig;

pub const VM_HOST_ALIAS: &str = "host.lima.internal";

/// Ordered probe list: local proxy, host-provided gateway, link-local fallback.
pub fn candidates(cfg: &GatewayConfig) -> Vec<String> {
    let mut out = vec![cfg.local_proxy.clone()];
    if let Some(gw) = host_config_gateway(cfg) {
        out.push(gw);
    }
    out.push(cfg.fallback.clone());
    out.retain(|s| !s.trim().is_empty());
    out.dedup();
    out
}

fn host_config_gateway(cfg: &GatewayConfig) -> Option<String> {
    let text = fs::read_to_string(&cfg.host_config).ok()?;
    let v: serde_json::Value = serde_json::from_str(&text).ok()?;
    v.get("llm_gateway")?
        .as_str()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn is_reachable(url: &str, timeout: Duration) -> bool {
    let client = match reqwest::blocking::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            tracing::debug!(error = %e, "cannot build http client");
            return false;
        }
    };
    match client.get(url).send() {
        Ok(resp) => {
            tracing::debug!(url, status = %resp.status(), "gateway answered");
            true
        }
        Err(e) => {
            tracing::debug!(url, error = %e, "gateway unreachable");
            false
        }
    }
}

/// First probe-confirmed candidate, or `LLM_GATEWAY` when set (taken as-is, not probed).
pub fn discover(cfg: &GatewayConfig) -> Option<String> {
    if let Ok(v) = env::var("LLM_GATEWAY") {
        if !v.trim().is_empty() {
            return Some(v);
        }
    }
    let timeout = Duration::from_millis(cfg.probe_timeout_ms);
    candidates(cfg)
        .into_iter()
        .find(|url| is_reachable(url, timeout))
}

/// Rewrite a loopback gateway so it resolves from inside the VM.
pub fn for_vm(gateway: &str) -> String {
    let Ok(mut u) = Url::parse(gateway) else {
        return gateway.to_string();
    };
    let loopback = matches!(u.host_str(), Some("127.0.0.1") | Some("localhost") | Some("[::1]"));
    if loopback && u.set_host(Some(VM_HOST_ALIAS)).is_ok() {
        let s = u.to_string();
        // Url adds a trailing slash to bare authorities; keep the caller's form.
        if !gateway.ends_with('/') && s.ends_with('/') && u.path() == "/" {
            return s.trim_end_matches('/').to_string();
        }
        return s;
    }
    gateway.to_string()
}
