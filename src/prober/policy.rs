//! Network policy guard
//!
//! Keeps the engine from being used to probe internal infrastructure: unless
//! `allow_private_networks` is set, a target whose host resolves to a
//! loopback, private, link-local, shared (CGNAT) or unspecified address is
//! refused before any connection is opened.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use reqwest::redirect;
use tokio::net::lookup_host;

use super::ProbeError;

pub const MAX_REDIRECTS: usize = 5;

/// Whether the policy forbids connecting to `ip`
pub fn is_blocked(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_v4(v4),
        IpAddr::V6(v6) => is_blocked_v6(v6),
    }
}

fn is_blocked_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    // 100.64.0.0/10
    let shared = a == 100 && (b & 0xc0) == 64;

    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || shared
}

fn is_blocked_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_blocked_v4(v4);
    }

    let first = ip.segments()[0];
    let unique_local = (first & 0xfe00) == 0xfc00;
    let link_local = (first & 0xffc0) == 0xfe80;

    ip.is_loopback() || ip.is_unspecified() || unique_local || link_local
}

/// Resolve `host:port` into socket addresses
pub async fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>, ProbeError> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(ProbeError::InvalidTarget("empty host".to_string()));
    }

    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|e| ProbeError::Dns(format!("{host}: {e}")))?
        .collect();

    if addrs.is_empty() {
        return Err(ProbeError::Dns(format!("{host}: no addresses")));
    }

    Ok(addrs)
}

/// Refuse the target if any resolved address is forbidden
pub fn ensure_allowed(addrs: &[SocketAddr]) -> Result<(), ProbeError> {
    match addrs.iter().find(|addr| is_blocked(addr.ip())) {
        Some(addr) => Err(ProbeError::PolicyBlocked(addr.ip().to_string())),
        None => Ok(()),
    }
}

/// Redirect policy for the guarded HTTP client
///
/// Redirect targets are not resolved again, so only literal addresses and
/// `localhost` are caught here.
pub fn guarded_redirects() -> redirect::Policy {
    redirect::Policy::custom(|attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error("too many redirects");
        }

        let host = attempt.url().host_str().unwrap_or_default().to_ascii_lowercase();
        let literal = host.trim_start_matches('[').trim_end_matches(']');
        let blocked = host == "localhost"
            || host.ends_with(".localhost")
            || literal.parse::<IpAddr>().map(is_blocked).unwrap_or(false);

        if blocked {
            attempt.error(format!("redirect to {host} blocked by network policy"))
        } else {
            attempt.follow()
        }
    })
}
