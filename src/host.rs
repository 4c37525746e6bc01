//! Host identity lookup: run mode, hostname, system and public IP.

use std::net::UdpSocket;
use std::time::Duration;

/// Development run mode: fail-fast calls, random member selection.
pub const DEVELOP_MODE: &str = "development";

/// Production run mode: failover calls, round-robin member selection.
pub const PRODUCE_MODE: &str = "production";

const UNKNOWN: &str = "unknown";

/// Who this process is, as reported in debug replies and notifications.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceIdentity {
    pub mode: String,
    pub name: String,
    pub hostname: String,
    pub system_ip: String,
    pub public_ip: String,
    /// Advertised `host:port`.
    pub addr: String,
}

/// Run mode read from the env var named `mode_key`, defaulting to development.
pub fn run_mode(mode_key: &str) -> String {
    if mode_key.is_empty() {
        return DEVELOP_MODE.to_string();
    }
    match std::env::var(mode_key) {
        Ok(v) if !v.is_empty() => v,
        _ => DEVELOP_MODE.to_string(),
    }
}

/// True for any mode that is not development.
pub fn is_production_like(mode: &str) -> bool {
    mode != DEVELOP_MODE
}

/// Lowercased local hostname, empty if it cannot be read.
pub fn hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .map(|h| h.to_lowercase())
        .unwrap_or_default()
}

/// Primary outbound IPv4 address of this host.
///
/// Connecting a UDP socket selects a route without sending any packet.
pub fn system_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    if ip.is_unspecified() || ip.is_loopback() {
        return None;
    }
    Some(ip.to_string())
}

/// Public IP as reported by an echo endpoint, `"unknown"` on any failure.
pub fn public_ip(echo_url: &str) -> String {
    if echo_url.is_empty() {
        return UNKNOWN.to_string();
    }
    let body = match ureq::get(echo_url).timeout(Duration::from_secs(3)).call() {
        Ok(response) => response.into_string().ok(),
        Err(e) => {
            tracing::debug!(error = %e, "public ip lookup failed");
            None
        }
    };
    match body {
        Some(b) if !b.trim().is_empty() => b.trim().to_string(),
        _ => UNKNOWN.to_string(),
    }
}

/// Replace an unspecified bind host with the system IP.
pub fn advertised_addr(bind_addr: &str, system_ip: &str) -> String {
    if system_ip.is_empty() {
        return bind_addr.to_string();
    }
    bind_addr.replacen("0.0.0.0", system_ip, 1)
}
