//! Client IP resolution with trusted-proxy validation.
//!
//! # Trust Model
//!
//! `X-Forwarded-For` and `X-Real-IP` are client-controlled headers. They are
//! honoured only when the TCP peer is inside one of the `TRUSTED_PROXIES`
//! CIDR ranges; a request arriving directly from any other address is keyed
//! by that address and its headers are ignored. Without a trusted proxy
//! list, forwarding headers are never honoured for connected peers.
//!
//! When the peer address is unavailable (the router is driven in-process
//! without `ConnectInfo`), the headers are the only source and are used.
//!
//! # X-Forwarded-For Walk
//!
//! Each proxy appends the address it received the request from, so the list
//! is read right to left, skipping trusted proxies. The first untrusted hop
//! is the client. Entries to its left were written by the client and are
//! ignored.
//!
//! ```text
//! X-Forwarded-For: 198.51.100.7, 203.0.113.50, 10.0.0.2     (peer 10.0.0.3)
//!                  ^ spoofable   ^ client      ^ trusted hop
//! ```
//!
//! # The "unknown" Fallback
//!
//! Requests with no peer address and no headers share the `"unknown"` key and
//! are therefore rate limited collectively.

use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::Request;
use tracing::{debug, warn};

/// Fallback value when no client IP can be determined.
pub const UNKNOWN_IP: &str = "unknown";

// =============================================================================
// Trusted Proxy CIDR Matching
// =============================================================================

/// Parsed CIDR network range for trusted proxy validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    /// Parse a CIDR notation string (e.g., "10.0.0.0/8" or "::1/128").
    ///
    /// A bare address is an implicit /32 or /128.
    pub fn parse(cidr: &str) -> Option<Self> {
        let cidr = cidr.trim();
        let (addr, prefix) = match cidr.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (cidr, None),
        };

        let network: IpAddr = addr.parse().ok()?;
        let max_prefix = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix_len = match prefix {
            Some(p) => p.parse::<u8>().ok().filter(|p| *p <= max_prefix)?,
            None => max_prefix,
        };

        Some(Self {
            network,
            prefix_len,
        })
    }

    /// Check if an IP address is contained within this CIDR range.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (&self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = u32::MAX
                    .checked_shl(32 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                (u32::from(*net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = u128::MAX
                    .checked_shl(128 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                (u128::from(*net) & mask) == (u128::from(*addr) & mask)
            }
            // IPv4 and IPv6 don't match
            _ => false,
        }
    }
}

/// Reverse proxies whose forwarding headers are believed.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxyConfig {
    ranges: Vec<CidrRange>,
}

impl TrustedProxyConfig {
    /// Invalid CIDR strings are logged and skipped.
    pub fn new(cidrs: &[String]) -> Self {
        let ranges: Vec<CidrRange> = cidrs
            .iter()
            .filter_map(|cidr| {
                let parsed = CidrRange::parse(cidr);
                if parsed.is_none() {
                    warn!(cidr = %cidr, "Invalid CIDR range in TRUSTED_PROXIES, skipping");
                }
                parsed
            })
            .collect();

        if !ranges.is_empty() {
            debug!(count = ranges.len(), "Trusted proxy validation enabled");
        }

        Self { ranges }
    }

    pub fn is_enabled(&self) -> bool {
        !self.ranges.is_empty()
    }

    pub fn is_trusted(&self, ip: &IpAddr) -> bool {
        self.ranges.iter().any(|range| range.contains(ip))
    }
}

// =============================================================================
// Extraction
// =============================================================================

fn header<'a, B>(req: &'a Request<B>, name: &str) -> Option<&'a str> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Client address from the forwarding headers, walking past trusted hops.
fn from_forwarding_headers<B>(req: &Request<B>, trusted: &TrustedProxyConfig) -> Option<String> {
    if let Some(xff) = header(req, "x-forwarded-for") {
        let hops: Vec<&str> = xff.split(',').map(str::trim).filter(|h| !h.is_empty()).collect();
        let client = hops
            .iter()
            .rev()
            .find(|hop| !hop.parse::<IpAddr>().is_ok_and(|ip| trusted.is_trusted(&ip)))
            .or_else(|| hops.first());
        if let Some(client) = client {
            return Some((*client).to_string());
        }
    }
    header(req, "x-real-ip").map(str::to_string)
}

/// Resolve the client IP for rate limiting and audit records.
pub fn client_ip<B>(req: &Request<B>, trusted: &TrustedProxyConfig) -> String {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    match peer {
        Some(peer) if trusted.is_trusted(&peer) => {
            from_forwarding_headers(req, trusted).unwrap_or_else(|| peer.to_string())
        }
        Some(peer) => {
            if header(req, "x-forwarded-for").is_some() && trusted.is_enabled() {
                debug!(peer = %peer, "Ignoring X-Forwarded-For from untrusted peer");
            }
            peer.to_string()
        }
        None => from_forwarding_headers(req, trusted).unwrap_or_else(|| UNKNOWN_IP.to_string()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn trusted(cidrs: &[&str]) -> TrustedProxyConfig {
        TrustedProxyConfig::new(&cidrs.iter().map(|c| c.to_string()).collect::<Vec<_>>())
    }

    fn request(peer: Option<&str>, headers: &[(&str, &str)]) -> Request<Body> {
        let mut builder = Request::builder();
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let mut req = builder.body(Body::empty()).unwrap();
        if let Some(peer) = peer {
            req.extensions_mut()
                .insert(ConnectInfo::<SocketAddr>(peer.parse().unwrap()));
        }
        req
    }

    #[test]
    fn test_cidr_parse() {
        assert_eq!(CidrRange::parse("10.0.0.0/8").unwrap().prefix_len, 8);
        assert_eq!(CidrRange::parse("::1/128").unwrap().prefix_len, 128);
        assert_eq!(CidrRange::parse("192.168.1.1").unwrap().prefix_len, 32);
        assert!(CidrRange::parse("not-an-ip").is_none());
        assert!(CidrRange::parse("10.0.0.0/33").is_none());
    }

    #[test]
    fn test_cidr_contains() {
        let cidr = CidrRange::parse("10.0.0.0/8").unwrap();
        assert!(cidr.contains(&"10.255.255.255".parse().unwrap()));
        assert!(!cidr.contains(&"11.0.0.1".parse().unwrap()));
        assert!(!cidr.contains(&"::1".parse().unwrap()));

        let all = CidrRange::parse("0.0.0.0/0").unwrap();
        assert!(all.contains(&"8.8.8.8".parse().unwrap()));

        let v6 = CidrRange::parse("2001:db8::/32").unwrap();
        assert!(v6.contains(&"2001:db8::1".parse().unwrap()));
        assert!(!v6.contains(&"2001:db9::1".parse().unwrap()));
    }

    #[test]
    fn test_untrusted_peer_headers_ignored() {
        let req = request(Some("198.51.100.4:5000"), &[("x-forwarded-for", "1.2.3.4")]);
        assert_eq!(client_ip(&req, &trusted(&["10.0.0.0/8"])), "198.51.100.4");
        assert_eq!(client_ip(&req, &TrustedProxyConfig::default()), "198.51.100.4");
    }

    #[test]
    fn test_trusted_peer_walks_xff() {
        let req = request(
            Some("10.0.0.3:443"),
            &[("x-forwarded-for", "198.51.100.7, 203.0.113.50, 10.0.0.2")],
        );
        assert_eq!(client_ip(&req, &trusted(&["10.0.0.0/8"])), "203.0.113.50");
    }

    #[test]
    fn test_trusted_peer_real_ip_and_fallback() {
        let proxies = trusted(&["10.0.0.0/8"]);
        let req = request(Some("10.0.0.3:443"), &[("x-real-ip", "203.0.113.9")]);
        assert_eq!(client_ip(&req, &proxies), "203.0.113.9");

        let bare = request(Some("10.0.0.3:443"), &[]);
        assert_eq!(client_ip(&bare, &proxies), "10.0.0.3");
    }

    #[test]
    fn test_all_hops_trusted_uses_leftmost() {
        let req = request(Some("10.0.0.3:443"), &[("x-forwarded-for", "10.1.1.1, 10.2.2.2")]);
        assert_eq!(client_ip(&req, &trusted(&["10.0.0.0/8"])), "10.1.1.1");
    }

    #[test]
    fn test_without_peer_headers_are_used() {
        let req = request(None, &[("x-forwarded-for", "192.168.1.1, 10.0.0.1")]);
        assert_eq!(client_ip(&req, &TrustedProxyConfig::default()), "10.0.0.1");

        let req = request(None, &[("x-real-ip", "::1")]);
        assert_eq!(client_ip(&req, &TrustedProxyConfig::default()), "::1");

        let req = request(None, &[("x-forwarded-for", "  ")]);
        assert_eq!(client_ip(&req, &TrustedProxyConfig::default()), UNKNOWN_IP);
    }
}
