//! Client identity resolution behind reverse proxies.
//!
//! Forwarding headers are only honored when the direct peer is a configured trusted
//! proxy. `X-Forwarded-For` is walked from the right (nearest hop) to the left, so a
//! client cannot spoof its identity by prepending addresses: the first hop that is
//! not a trusted proxy, or the first hop beyond `max_proxy_hops`, is the client.
//!
//! Also hosts the bounded user-agent matcher used for rate-limit bypass.

use crate::config::ConfigError;
use http::header::{HeaderMap, USER_AGENT};
use ipnet::IpNet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

/// Longest combined `X-Forwarded-For` value considered; longer headers are ignored.
pub const MAX_FORWARDED_LEN: usize = 8 * 1024;

/// Entries considered from the right of `X-Forwarded-For`.
pub const MAX_FORWARDED_ENTRIES: usize = 32;

/// Bytes of a user agent inspected by [`UserAgentMatcher`].
pub const MAX_USER_AGENT_LEN: usize = 512;

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_REAL_IP: &str = "x-real-ip";

/// One trusted-proxy entry: a single address or a CIDR block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustedProxy {
    Addr(IpAddr),
    Net(IpNet),
}

impl TrustedProxy {
    pub fn contains(&self, ip: &IpAddr) -> bool {
        let ip = canonical(*ip);
        match self {
            TrustedProxy::Addr(addr) => canonical(*addr) == ip,
            TrustedProxy::Net(net) => net.contains(&ip),
        }
    }
}

impl FromStr for TrustedProxy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.contains('/') {
            s.parse::<IpNet>()
                .map(TrustedProxy::Net)
                .map_err(|_| ConfigError::InvalidTrustedProxy(s.to_string()))
        } else {
            s.parse::<IpAddr>()
                .map(TrustedProxy::Addr)
                .map_err(|_| ConfigError::InvalidTrustedProxy(s.to_string()))
        }
    }
}

/// Which peers may vouch for a client address, and how far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustConfig {
    proxies: Vec<TrustedProxy>,
    max_proxy_hops: usize,
    trust_x_real_ip: bool,
}

impl Default for TrustConfig {
    /// No trusted proxies: the peer address is always the identity.
    fn default() -> Self {
        Self { proxies: Vec::new(), max_proxy_hops: 1, trust_x_real_ip: false }
    }
}

impl TrustConfig {
    pub fn new(proxies: impl IntoIterator<Item = TrustedProxy>, max_proxy_hops: usize) -> Self {
        Self { proxies: proxies.into_iter().collect(), max_proxy_hops, trust_x_real_ip: false }
    }

    /// Parse proxies from strings (addresses or CIDRs).
    pub fn parse<I, T>(proxies: I, max_proxy_hops: usize) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let proxies = proxies
            .into_iter()
            .map(|p| p.as_ref().parse())
            .collect::<Result<Vec<TrustedProxy>, _>>()?;
        Ok(Self::new(proxies, max_proxy_hops))
    }

    /// Prefer `X-Real-IP` from a trusted peer over walking `X-Forwarded-For`.
    pub fn with_x_real_ip(mut self, trust: bool) -> Self {
        self.trust_x_real_ip = trust;
        self
    }

    pub fn is_trusted(&self, ip: &IpAddr) -> bool {
        self.proxies.iter().any(|proxy| proxy.contains(ip))
    }

    pub fn proxies(&self) -> &[TrustedProxy] {
        &self.proxies
    }

    pub fn max_proxy_hops(&self) -> usize {
        self.max_proxy_hops
    }

    pub fn trusts_x_real_ip(&self) -> bool {
        self.trust_x_real_ip
    }
}

/// Resolved client identity: a canonical IP string, or the raw forwarded entry when
/// the nearest untrusted hop is not a parseable address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(Arc<str>);

impl Identity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<IpAddr> for Identity {
    fn from(ip: IpAddr) -> Self {
        Identity(canonical(ip).to_string().into())
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolve the client behind `peer`.
pub fn resolve(peer: IpAddr, headers: &HeaderMap, trust: &TrustConfig) -> Identity {
    if !trust.is_trusted(&peer) {
        return Identity::from(peer);
    }

    if trust.trust_x_real_ip {
        if let Some(ip) = headers
            .get(X_REAL_IP)
            .and_then(|v| v.to_str().ok())
            .filter(|v| v.len() <= MAX_FORWARDED_LEN)
            .and_then(parse_hop)
        {
            return Identity::from(ip);
        }
    }

    let Some(forwarded) = forwarded_for(headers) else {
        return Identity::from(peer);
    };
    let hops: Vec<&str> = forwarded.split(',').map(str::trim).filter(|h| !h.is_empty()).collect();
    let considered = &hops[hops.len().saturating_sub(MAX_FORWARDED_ENTRIES)..];

    for (distance, hop) in considered.iter().rev().enumerate() {
        let parsed = parse_hop(hop);
        let trusted = parsed.is_some_and(|ip| trust.is_trusted(&ip));
        if distance >= trust.max_proxy_hops || !trusted {
            return hop_identity(hop, parsed);
        }
    }

    // Every hop is a trusted proxy: the leftmost entry is the original claim.
    match considered.first() {
        Some(hop) => hop_identity(hop, parse_hop(hop)),
        None => Identity::from(peer),
    }
}

/// Joined `X-Forwarded-For` values, or `None` when absent, non-ASCII or oversized.
fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    let mut joined = String::new();
    for value in headers.get_all(X_FORWARDED_FOR) {
        let value = value.to_str().ok()?;
        if joined.len() + value.len() + 1 > MAX_FORWARDED_LEN {
            tracing::debug!("Ignoring oversized X-Forwarded-For");
            return None;
        }
        if !joined.is_empty() {
            joined.push(',');
        }
        joined.push_str(value);
    }
    (!joined.is_empty()).then_some(joined)
}

fn hop_identity(hop: &str, parsed: Option<IpAddr>) -> Identity {
    match parsed {
        Some(ip) => Identity::from(ip),
        None => Identity(hop.into()),
    }
}

/// Parse one forwarded hop, accepting `ip`, `ip:port`, `[v6]` and `[v6]:port`.
fn parse_hop(hop: &str) -> Option<IpAddr> {
    let hop = hop.trim();
    if let Ok(ip) = hop.parse::<IpAddr>() {
        return Some(ip);
    }
    if let Ok(addr) = hop.parse::<SocketAddr>() {
        return Some(addr.ip());
    }
    hop.strip_prefix('[').and_then(|h| h.strip_suffix(']')).and_then(|h| h.parse().ok())
}

/// IPv4-mapped IPv6 addresses compare as their IPv4 form.
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
        v4 => v4,
    }
}

/// Case-insensitive substring matcher over a bounded user-agent prefix.
///
/// `User-Agent` is client-controlled; a match says nothing about who is calling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserAgentMatcher {
    needles: Vec<String>,
}

impl UserAgentMatcher {
    pub fn new<I, T>(needles: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let needles = needles
            .into_iter()
            .map(|n| n.as_ref().trim().to_ascii_lowercase())
            .filter(|n| !n.is_empty())
            .collect();
        Self { needles }
    }

    pub fn is_empty(&self) -> bool {
        self.needles.is_empty()
    }

    pub fn matches(&self, user_agent: &str) -> bool {
        if self.needles.is_empty() {
            return false;
        }
        let haystack = bounded(user_agent, MAX_USER_AGENT_LEN).to_ascii_lowercase();
        self.needles.iter().any(|needle| haystack.contains(needle.as_str()))
    }

    /// Match the request's `User-Agent` header, if any.
    pub fn matches_headers(&self, headers: &HeaderMap) -> bool {
        headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ua| self.matches(ua))
    }
}

fn bounded(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn xff(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn untrusted_peer_is_the_identity() {
        let trust = TrustConfig::parse(["10.0.0.0/8"], 1).unwrap();
        let id = resolve(ip("203.0.113.9"), &xff("1.1.1.1"), &trust);
        assert_eq!(id.as_str(), "203.0.113.9");
    }

    #[test]
    fn no_trusted_proxies_ignores_headers() {
        let id = resolve(ip("10.0.0.1"), &xff("1.1.1.1"), &TrustConfig::default());
        assert_eq!(id.as_str(), "10.0.0.1");
    }

    #[test]
    fn parse_hop_forms() {
        assert_eq!(parse_hop("1.2.3.4:8080"), Some(ip("1.2.3.4")));
        assert_eq!(parse_hop("[2001:db8::1]:443"), Some(ip("2001:db8::1")));
        assert_eq!(parse_hop("[2001:db8::1]"), Some(ip("2001:db8::1")));
        assert_eq!(parse_hop("2001:db8::1"), Some(ip("2001:db8::1")));
        assert_eq!(parse_hop("unknown"), None);
    }

    #[test]
    fn mapped_v6_matches_v4_proxy() {
        let proxy: TrustedProxy = "10.0.0.1".parse().unwrap();
        assert!(proxy.contains(&ip("::ffff:10.0.0.1")));
        assert_eq!(Identity::from(ip("::ffff:192.0.2.1")).as_str(), "192.0.2.1");
    }

    #[test]
    fn malformed_proxy_entries_are_rejected() {
        assert!(matches!(
            "10.0.0.0/99".parse::<TrustedProxy>(),
            Err(ConfigError::InvalidTrustedProxy(_))
        ));
        assert!("not-an-ip".parse::<TrustedProxy>().is_err());
    }

    #[test]
    fn user_agent_matching_is_bounded_and_case_insensitive() {
        let matcher = UserAgentMatcher::new(["HealthCheck", " "]);
        assert!(matcher.matches("Consul healthcheck/1.0"));
        assert!(!matcher.matches("curl/8.0"));

        let late = format!("{}healthcheck", "x".repeat(MAX_USER_AGENT_LEN));
        assert!(!matcher.matches(&late));
        assert!(!UserAgentMatcher::default().matches("healthcheck"));
    }

    #[test]
    fn bounded_respects_char_boundaries() {
        let s = "é".repeat(300);
        let cut = bounded(&s, MAX_USER_AGENT_LEN);
        assert!(cut.len() <= MAX_USER_AGENT_LEN);
        assert!(s.starts_with(cut));
    }
}
