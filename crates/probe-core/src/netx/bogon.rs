//! Bogon detection
//!
//! Addresses from reserved or otherwise not globally routable ranges. A
//! public resolver returning one of these is a strong hint of tampering.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const BOGONS_V4: &[(Ipv4Addr, u8)] = &[
    (Ipv4Addr::new(0, 0, 0, 0), 8),
    (Ipv4Addr::new(10, 0, 0, 0), 8),
    (Ipv4Addr::new(100, 64, 0, 0), 10),
    (Ipv4Addr::new(127, 0, 0, 0), 8),
    (Ipv4Addr::new(169, 254, 0, 0), 16),
    (Ipv4Addr::new(172, 16, 0, 0), 12),
    (Ipv4Addr::new(192, 0, 0, 0), 24),
    (Ipv4Addr::new(192, 0, 2, 0), 24),
    (Ipv4Addr::new(192, 168, 0, 0), 16),
    (Ipv4Addr::new(198, 18, 0, 0), 15),
    (Ipv4Addr::new(198, 51, 100, 0), 24),
    (Ipv4Addr::new(203, 0, 113, 0), 24),
    (Ipv4Addr::new(224, 0, 0, 0), 4),
    (Ipv4Addr::new(240, 0, 0, 0), 4),
    (Ipv4Addr::new(255, 255, 255, 255), 32),
];

const BOGONS_V6: &[(Ipv6Addr, u8)] = &[
    (Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 0), 128),
    (Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 1), 128),
    (Ipv6Addr::new(0, 0, 0, 0, 0, 0xffff, 0, 0), 96),
    (Ipv6Addr::new(0x100, 0, 0, 0, 0, 0, 0, 0), 64),
    (Ipv6Addr::new(0x2001, 0x10, 0, 0, 0, 0, 0, 0), 28),
    (Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0), 32),
    (Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 7),
    (Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 10),
    (Ipv6Addr::new(0xff00, 0, 0, 0, 0, 0, 0, 0), 8),
];

/// Whether `address` is a bogon. Strings that are not IP addresses count
/// as bogons.
pub fn is_bogon(address: &str) -> bool {
    address.parse::<IpAddr>().map_or(true, is_bogon_ip)
}

/// Whether `ip` falls in a reserved range
pub fn is_bogon_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let bits = u32::from(v4);
            BOGONS_V4.iter().any(|(net, prefix)| {
                let mask = u32::MAX.checked_shl(32 - u32::from(*prefix)).unwrap_or(0);
                bits & mask == u32::from(*net) & mask
            })
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            BOGONS_V6.iter().any(|(net, prefix)| {
                let mask = u128::MAX.checked_shl(128 - u32::from(*prefix)).unwrap_or(0);
                bits & mask == u128::from(*net) & mask
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_public_addresses() {
        for addr in ["8.8.8.8", "93.184.216.34", "1.1.1.1", "2001:4860:4860::8888"] {
            assert!(!is_bogon(addr), "{addr}");
        }
    }

    #[test]
    fn test_reserved_addresses() {
        for addr in [
            "10.0.0.1",
            "127.0.0.1",
            "192.168.1.1",
            "172.16.5.4",
            "172.31.255.255",
            "100.64.0.1",
            "169.254.1.1",
            "0.0.0.0",
            "255.255.255.255",
            "224.0.0.1",
            "::1",
            "::",
            "fe80::1",
            "fd00::1",
            "2001:db8::1",
            "::ffff:8.8.8.8",
        ] {
            assert!(is_bogon(addr), "{addr}");
        }
    }

    #[test]
    fn test_edges() {
        assert!(!is_bogon("172.32.0.1"));
        assert!(!is_bogon("100.128.0.1"));
        assert!(!is_bogon("11.0.0.1"));
    }

    #[test]
    fn test_not_an_address() {
        assert!(is_bogon("example.com"));
        assert!(is_bogon(""));
    }

    proptest! {
        #[test]
        fn prop_rfc1918_10_is_bogon(b in any::<u8>(), c in any::<u8>(), d in any::<u8>()) {
            let addr = format!("10.{b}.{c}.{d}");
            prop_assert!(is_bogon(&addr));
        }

        #[test]
        fn prop_never_panics(s in ".*") {
            let _ = is_bogon(&s);
        }
    }
}
