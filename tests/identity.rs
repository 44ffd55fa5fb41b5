use http::{HeaderMap, HeaderValue};
use std::net::IpAddr;
use tollgate::identity::{resolve, TrustConfig, MAX_FORWARDED_ENTRIES, MAX_FORWARDED_LEN};

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
        map.append(*name, HeaderValue::from_str(value).unwrap());
    }
    map
}

fn behind_one_proxy() -> TrustConfig {
    TrustConfig::parse(["10.0.0.0/8"], 1).unwrap()
}

#[test]
fn client_supplied_prefix_cannot_spoof() {
    // The client sent "6.6.6.6"; the proxy appended the real address.
    let h = headers(&[("x-forwarded-for", "6.6.6.6, 198.51.100.7")]);
    let id = resolve(ip("10.1.2.3"), &h, &behind_one_proxy());
    assert_eq!(id.as_str(), "198.51.100.7");
}

#[test]
fn direct_clients_cannot_use_the_header_at_all() {
    let h = headers(&[("x-forwarded-for", "10.0.0.1"), ("x-real-ip", "10.0.0.1")]);
    let trust = behind_one_proxy().with_x_real_ip(true);
    assert_eq!(resolve(ip("203.0.113.50"), &h, &trust).as_str(), "203.0.113.50");
}

#[test]
fn trusted_peer_without_header_is_the_identity() {
    let id = resolve(ip("10.0.0.4"), &HeaderMap::new(), &behind_one_proxy());
    assert_eq!(id.as_str(), "10.0.0.4");
}

#[test]
fn hop_limit_bounds_how_far_we_walk() {
    let h = headers(&[("x-forwarded-for", "198.51.100.7, 10.0.0.9, 10.0.0.8")]);

    // One hop: 10.0.0.8 is skipped, and 10.0.0.9 is as far as we go.
    let one = TrustConfig::parse(["10.0.0.0/8"], 1).unwrap();
    assert_eq!(resolve(ip("10.0.0.1"), &h, &one).as_str(), "10.0.0.9");

    let two = TrustConfig::parse(["10.0.0.0/8"], 2).unwrap();
    assert_eq!(resolve(ip("10.0.0.1"), &h, &two).as_str(), "198.51.100.7");
}

#[test]
fn all_trusted_chain_yields_leftmost_entry() {
    let h = headers(&[("x-forwarded-for", "10.0.0.5, 10.0.0.6")]);
    let trust = TrustConfig::parse(["10.0.0.0/8"], 8).unwrap();
    assert_eq!(resolve(ip("10.0.0.1"), &h, &trust).as_str(), "10.0.0.5");
}

#[test]
fn repeated_headers_are_joined_in_order() {
    let h = headers(&[("x-forwarded-for", "6.6.6.6"), ("x-forwarded-for", "198.51.100.7")]);
    assert_eq!(resolve(ip("10.0.0.1"), &h, &behind_one_proxy()).as_str(), "198.51.100.7");
}

#[test]
fn ports_and_brackets_are_stripped() {
    let trust = behind_one_proxy();
    let v4 = headers(&[("x-forwarded-for", "198.51.100.7:51234")]);
    assert_eq!(resolve(ip("10.0.0.1"), &v4, &trust).as_str(), "198.51.100.7");

    let v6 = headers(&[("x-forwarded-for", "[2001:db8::7]:443")]);
    assert_eq!(resolve(ip("10.0.0.1"), &v6, &trust).as_str(), "2001:db8::7");
}

#[test]
fn ipv6_proxies_and_mapped_peers() {
    let trust = TrustConfig::parse(["fd00::/8", "10.0.0.0/8"], 1).unwrap();
    let h = headers(&[("x-forwarded-for", "2a00:1450:4001::1")]);
    assert_eq!(resolve(ip("fd00::1"), &h, &trust).as_str(), "2a00:1450:4001::1");
    assert_eq!(resolve(ip("::ffff:10.0.0.1"), &h, &trust).as_str(), "2a00:1450:4001::1");

    // A mapped client address is reported in its IPv4 form.
    let mapped = headers(&[("x-forwarded-for", "::ffff:198.51.100.7")]);
    assert_eq!(resolve(ip("fd00::1"), &mapped, &trust).as_str(), "198.51.100.7");
}

#[test]
fn malformed_nearest_hop_is_used_verbatim() {
    let h = headers(&[("x-forwarded-for", "198.51.100.7, unknown")]);
    assert_eq!(resolve(ip("10.0.0.1"), &h, &behind_one_proxy()).as_str(), "unknown");
}

#[test]
fn x_real_ip_is_opt_in() {
    let h = headers(&[("x-real-ip", "198.51.100.20"), ("x-forwarded-for", "198.51.100.7")]);
    let peer = ip("10.0.0.1");
    assert_eq!(resolve(peer, &h, &behind_one_proxy()).as_str(), "198.51.100.7");

    let trust = behind_one_proxy().with_x_real_ip(true);
    assert_eq!(resolve(peer, &h, &trust).as_str(), "198.51.100.20");

    // Unparseable X-Real-IP falls through to X-Forwarded-For.
    let bad = headers(&[("x-real-ip", "nope"), ("x-forwarded-for", "198.51.100.7")]);
    assert_eq!(resolve(peer, &bad, &trust).as_str(), "198.51.100.7");
}

#[test]
fn oversized_header_is_ignored() {
    let mut value = "198.51.100.1, ".repeat(MAX_FORWARDED_LEN / 14 + 1);
    value.push_str("198.51.100.7");
    assert!(value.len() > MAX_FORWARDED_LEN);
    let h = headers(&[("x-forwarded-for", value.as_str())]);
    assert_eq!(resolve(ip("10.0.0.1"), &h, &behind_one_proxy()).as_str(), "10.0.0.1");
}

#[test]
fn only_the_most_recent_entries_are_considered() {
    let chain: Vec<String> = (0..MAX_FORWARDED_ENTRIES + 8).map(|n| format!("10.9.0.{n}")).collect();
    let joined = chain.join(", ");
    let h = headers(&[("x-forwarded-for", joined.as_str())]);
    let trust = TrustConfig::parse(["10.0.0.0/8"], usize::MAX).unwrap();
    // Every entry is trusted; the walk stops at the oldest considered entry.
    assert_eq!(resolve(ip("10.0.0.1"), &h, &trust).as_str(), "10.9.0.8");
}

#[test]
fn empty_entries_are_skipped() {
    let h = headers(&[("x-forwarded-for", "198.51.100.7, , ")]);
    assert_eq!(resolve(ip("10.0.0.1"), &h, &behind_one_proxy()).as_str(), "198.51.100.7");
}

#[test]
fn client_behind_a_proxy_that_repeats_its_own_address() {
    // Proxy 10.0.0.1 appended itself as well as the client it saw.
    let h = headers(&[("x-forwarded-for", "198.51.100.7, 10.0.0.1")]);
    assert_eq!(resolve(ip("10.0.0.1"), &h, &behind_one_proxy()).as_str(), "198.51.100.7");
}
