use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Returns `true` for addresses that belong to local or private infrastructure:
/// RFC 1918, loopback, link-local, CGNAT (`100.64.0.0/10`) and unspecified for IPv4, and
/// loopback, unique-local (`fc00::/7`), link-local (`fe80::/10`) and unspecified for IPv6.
/// IPv4-mapped IPv6 addresses are classified as their IPv4 address.
pub fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_private_v4(v4),
            None => is_private_v6(v6),
        },
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_private() ||
        ip.is_loopback() ||
        ip.is_link_local() ||
        ip.is_unspecified() ||
        (a == 100 && (b & 0xc0) == 64)
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback() ||
        ip.is_unspecified() ||
        (first & 0xfe00) == 0xfc00 ||
        (first & 0xffc0) == 0xfe80
}

/// Names that are private without asking any resolver.
pub fn is_local_name(name: &str) -> bool {
    let name = name.trim_end_matches('.');
    name.eq_ignore_ascii_case("localhost") || name.to_ascii_lowercase().ends_with(".localhost")
}
