//! Client identity for logging and rate-limit keys.
//!
//! Precedence: first non-empty `X-Forwarded-For` entry, then `X-Real-IP`,
//! then the transport peer's IP. The headers are taken on trust, which is
//! only sound when a reverse proxy in front of the service overwrites them.
//! Exposed directly to clients, they are spoofable.

use std::net::SocketAddr;

use http::HeaderMap;

/// Returned when there is neither a forwarding header nor a peer address.
pub const UNKNOWN_CLIENT: &str = "unknown";

pub fn client_ip(headers: &HeaderMap, remote_addr: Option<SocketAddr>) -> String {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    if let Some(first) = header("x-forwarded-for")
        .and_then(|xff| xff.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
    {
        return first.to_owned();
    }

    if let Some(real) = header("x-real-ip").filter(|ip| !ip.is_empty()) {
        return real.to_owned();
    }

    match remote_addr {
        Some(addr) => addr.ip().to_string(),
        None => UNKNOWN_CLIENT.to_owned(),
    }
}
