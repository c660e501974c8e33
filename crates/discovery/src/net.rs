//! Local interface and host name helpers.

use std::net::{IpAddr, Ipv4Addr};

/// Returns true for IPv4 addresses worth advertising or probing: not loopback,
/// not link-local (169.254.x.x / APIPA), not unspecified.
pub fn is_usable_ipv4(ip: Ipv4Addr) -> bool {
    !(ip.is_loopback() || ip.is_link_local() || ip.is_unspecified())
}

/// Returns local non-loopback IPv4 addresses, excluding link-local.
pub fn local_ipv4s() -> Vec<Ipv4Addr> {
    let Ok(interfaces) = if_addrs::get_if_addrs() else {
        return Vec::new();
    };

    let mut ips: Vec<Ipv4Addr> = interfaces
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .filter_map(|iface| match iface.ip() {
            IpAddr::V4(v4) if is_usable_ipv4(v4) => Some(v4),
            _ => None,
        })
        .collect();
    ips.sort();
    ips.dedup();
    ips
}

/// Returns every host address of the /24 around `ip` (`.1` through `.254`).
pub fn subnet_hosts(ip: Ipv4Addr) -> impl Iterator<Item = Ipv4Addr> {
    let [a, b, c, _] = ip.octets();
    (1..=254u8).map(move |d| Ipv4Addr::new(a, b, c, d))
}

/// Returns the local host name without any domain suffix.
pub fn hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .map(|h| strip_local_suffix(&h).to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".into())
}

/// Returns the local hostname suffixed with `.local.` as required by mDNS.
pub fn mdns_hostname() -> String {
    format!("{}.local.", hostname())
}

/// Strips a trailing `.local.` / `.local` / `.` from an mDNS host name.
pub fn strip_local_suffix(host: &str) -> &str {
    let host = host.trim_end_matches('.');
    host.strip_suffix(".local").unwrap_or(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usable_ipv4_filters_special_ranges() {
        assert!(is_usable_ipv4(Ipv4Addr::new(192, 168, 1, 10)));
        assert!(!is_usable_ipv4(Ipv4Addr::new(127, 0, 0, 1)));
        assert!(!is_usable_ipv4(Ipv4Addr::new(169, 254, 3, 4)));
        assert!(!is_usable_ipv4(Ipv4Addr::UNSPECIFIED));
    }

    #[test]
    fn subnet_hosts_cover_slash_24() {
        let hosts: Vec<Ipv4Addr> = subnet_hosts(Ipv4Addr::new(10, 1, 2, 77)).collect();
        assert_eq!(hosts.len(), 254);
        assert_eq!(hosts[0], Ipv4Addr::new(10, 1, 2, 1));
        assert_eq!(hosts[253], Ipv4Addr::new(10, 1, 2, 254));
    }

    #[test]
    fn strip_local_suffix_variants() {
        assert_eq!(strip_local_suffix("laptop.local."), "laptop");
        assert_eq!(strip_local_suffix("laptop.local"), "laptop");
        assert_eq!(strip_local_suffix("laptop."), "laptop");
        assert_eq!(strip_local_suffix("laptop"), "laptop");
    }

    #[test]
    fn hostnames_are_not_empty() {
        assert!(!hostname().is_empty());
        assert!(mdns_hostname().ends_with(".local."));
    }

    #[test]
    fn local_ips_are_usable() {
        for ip in local_ipv4s() {
            assert!(is_usable_ipv4(ip));
        }
    }
}
