//! SSRF protection
//!
//! Every host the appview dials is attacker-influenced: PDS endpoints come
//! out of DID documents, knot and spindle hosts out of user records. Block
//! private networks and loopback before any outbound connection unless the
//! deployment explicitly opts into insecure remotes (local development).

use crate::error::{AppError, AppResult};
use std::net::{Ipv4Addr, Ipv6Addr};
use url::{Host, Url};

/// Validate a full URL (scheme + host) before dialing it.
pub fn validate_remote_url(raw: &str, allow_insecure: bool) -> AppResult<()> {
    let parsed = Url::parse(raw).map_err(|e| {
        tracing::warn!(url = %raw, error = %e, "rejected malformed remote URL");
        AppError::Validation(format!("invalid remote URL: {e}"))
    })?;

    let scheme = parsed.scheme();
    if !matches!(scheme, "http" | "https" | "ws" | "wss") {
        return Err(AppError::Validation(format!(
            "invalid remote URL: scheme '{scheme}' not allowed"
        )));
    }
    let secure = matches!(scheme, "https" | "wss");
    if !secure && !allow_insecure {
        tracing::warn!(url = %raw, "rejected cleartext remote URL");
        return Err(AppError::Validation(
            "remote URLs must use https".to_string(),
        ));
    }

    let host = parsed
        .host()
        .ok_or_else(|| AppError::Validation("remote URL has no host".to_string()))?;

    if allow_insecure {
        return Ok(());
    }

    match host {
        Host::Ipv4(ip) => {
            if is_restricted_ipv4(&ip) {
                tracing::warn!(url = %raw, ip = %ip, "rejected private IPv4 remote");
                return Err(AppError::Validation(
                    "remote URL resolves to a private network".to_string(),
                ));
            }
        }
        Host::Ipv6(ip) => {
            if is_restricted_ipv6(&ip) {
                tracing::warn!(url = %raw, ip = %ip, "rejected private IPv6 remote");
                return Err(AppError::Validation(
                    "remote URL resolves to a private network".to_string(),
                ));
            }
        }
        Host::Domain(domain) => {
            if is_localhost_hostname(&domain.to_lowercase()) {
                tracing::warn!(url = %raw, "rejected localhost remote");
                return Err(AppError::Validation(
                    "remote URL may not point at localhost".to_string(),
                ));
            }
        }
    }

    Ok(())
}

/// Validate a bare `host[:port]` as found in repo records and event-source
/// registrations.
pub fn validate_remote_host(host: &str, allow_insecure: bool) -> AppResult<()> {
    if host.is_empty() || host.contains('/') || host.contains('@') {
        return Err(AppError::Validation(format!("invalid remote host: {host}")));
    }
    let scheme = if allow_insecure { "http" } else { "https" };
    validate_remote_url(&format!("{scheme}://{host}"), allow_insecure)
}

fn is_restricted_ipv4(ip: &Ipv4Addr) -> bool {
    let octets = ip.octets();
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_link_local()
        || octets[0] == 10
        || (octets[0] == 172 && (16..=31).contains(&octets[1]))
        || (octets[0] == 192 && octets[1] == 168)
        || (octets[0] == 169 && octets[1] == 254)
        || (octets[0] == 100 && (64..=127).contains(&octets[1]))
}

fn is_restricted_ipv6(ip: &Ipv6Addr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() {
        return true;
    }
    let segments = ip.segments();
    // fc00::/7 unique-local, fe80::/10 link-local
    (segments[0] & 0xfe00) == 0xfc00
        || (segments[0] & 0xffc0) == 0xfe80
        // v4-mapped addresses smuggling a private v4
        || ip
            .to_ipv4_mapped()
            .map(|v4| is_restricted_ipv4(&v4))
            .unwrap_or(false)
}

fn is_localhost_hostname(domain: &str) -> bool {
    domain == "localhost"
        || domain.ends_with(".localhost")
        || domain == "localhost."
        || domain.ends_with(".local")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_private_networks() {
        assert!(validate_remote_url("https://10.0.0.5/xrpc", false).is_err());
        assert!(validate_remote_url("https://192.168.1.1", false).is_err());
        assert!(validate_remote_url("https://172.16.0.1", false).is_err());
        assert!(validate_remote_url("https://127.0.0.1", false).is_err());
        assert!(validate_remote_url("https://169.254.0.1", false).is_err());
        assert!(validate_remote_url("https://[::1]", false).is_err());
        assert!(validate_remote_url("https://localhost", false).is_err());
    }

    #[test]
    fn blocks_cleartext_unless_opted_in() {
        assert!(validate_remote_url("http://pds.example.com", false).is_err());
        assert!(validate_remote_url("http://127.0.0.1:3000", true).is_ok());
    }

    #[test]
    fn allows_public_https() {
        assert!(validate_remote_url("https://pds.example.com", false).is_ok());
        assert!(validate_remote_url("wss://knot.example.com/events", false).is_ok());
    }

    #[test]
    fn bare_hosts() {
        assert!(validate_remote_host("knot.example.com", false).is_ok());
        assert!(validate_remote_host("knot.example.com:8443", false).is_ok());
        assert!(validate_remote_host("bad/path", false).is_err());
        assert!(validate_remote_host("user@host", false).is_err());
        assert!(validate_remote_host("localhost:3000", true).is_ok());
        assert!(validate_remote_host("localhost:3000", false).is_err());
    }
}
