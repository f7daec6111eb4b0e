//! Utility functions for Beacon
//!
//! Common helper functions used across the codebase.

use std::net::Ipv4Addr;
use std::sync::LazyLock;

use if_addrs::IfAddr;

/// Regex pattern for validating identifiers (service names, node ids, methods)
static VALID_PATTERN: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new("^[a-zA-Z0-9_.:/-]*$").expect("Invalid regex pattern"));

/// Validate a string contains only allowed characters
///
/// Allowed characters: alphanumeric, underscore, dot, colon, slash, hyphen
///
/// # Examples
///
/// ```
/// use beacon_common::is_valid;
///
/// assert!(is_valid("game-server"));
/// assert!(is_valid("region/game-server"));
/// assert!(!is_valid("with spaces"));
/// ```
pub fn is_valid(str: &str) -> bool {
    VALID_PATTERN.is_match(str)
}

/// Replace path separators in a service name so it occupies a single key segment.
///
/// ```
/// use beacon_common::sanitize_service_name;
///
/// assert_eq!(sanitize_service_name("region/game"), "region-game");
/// ```
pub fn sanitize_service_name(service_name: &str) -> String {
    service_name.replace('/', "-")
}

/// Whether the address belongs to one of the private/link-local ranges.
pub fn is_private_ip(ip: &Ipv4Addr) -> bool {
    ip.is_private() || ip.is_link_local()
}

/// Get the address a node should advertise.
///
/// Prefers a public IPv4 address, then any non-loopback IPv4 address,
/// then "127.0.0.1".
pub fn interface_ip() -> String {
    select_interface_ip(&ipv4_addrs())
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

fn select_interface_ip(addrs: &[Ipv4Addr]) -> Option<Ipv4Addr> {
    addrs
        .iter()
        .find(|ip| !is_private_ip(ip))
        .or_else(|| addrs.first())
        .copied()
}

fn ipv4_addrs() -> Vec<Ipv4Addr> {
    if_addrs::get_if_addrs()
        .map(|addrs| {
            addrs
                .into_iter()
                .filter(|iface| !iface.is_loopback())
                .filter_map(|iface| match iface.addr {
                    IfAddr::V4(addr) => Some(addr.ip),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_is_valid_names() {
        assert!(is_valid("abc123"));
        assert!(is_valid("game-server"));
        assert!(is_valid("game_server.v1"));
        assert!(is_valid("dc1/game"));
        assert!(is_valid(""));
    }

    #[test]
    fn test_is_valid_invalid_chars() {
        assert!(!is_valid("test value")); // space
        assert!(!is_valid("test@value")); // @
        assert!(!is_valid("test#value")); // #
        assert!(!is_valid("test*value")); // *
    }

    #[test]
    fn test_is_private_ip() {
        assert!(is_private_ip(&Ipv4Addr::new(192, 168, 1, 10)));
        assert!(is_private_ip(&Ipv4Addr::new(10, 0, 0, 1)));
        assert!(is_private_ip(&Ipv4Addr::new(172, 16, 0, 1)));
        assert!(is_private_ip(&Ipv4Addr::new(172, 31, 255, 1)));
        assert!(is_private_ip(&Ipv4Addr::new(169, 254, 3, 3)));
        assert!(!is_private_ip(&Ipv4Addr::new(8, 8, 8, 8)));
        assert!(!is_private_ip(&Ipv4Addr::new(172, 32, 0, 1)));
    }

    #[test]
    fn test_select_interface_ip_prefers_public() {
        let addrs = vec![
            Ipv4Addr::new(192, 168, 1, 10),
            Ipv4Addr::new(34, 12, 1, 2),
            Ipv4Addr::new(10, 0, 0, 1),
        ];
        assert_eq!(
            select_interface_ip(&addrs),
            Some(Ipv4Addr::new(34, 12, 1, 2))
        );
    }

    #[test]
    fn test_select_interface_ip_falls_back_to_private() {
        let addrs = vec![Ipv4Addr::new(10, 0, 0, 7), Ipv4Addr::new(192, 168, 0, 2)];
        assert_eq!(select_interface_ip(&addrs), Some(Ipv4Addr::new(10, 0, 0, 7)));
        assert_eq!(select_interface_ip(&[]), None);
    }

    #[test]
    fn test_interface_ip_returns_valid_ip() {
        let ip = interface_ip();
        assert!(ip.parse::<Ipv4Addr>().is_ok());
    }

    proptest! {
        #[test]
        fn sanitized_names_have_no_separator(name in "[a-z/_-]{0,32}") {
            let sanitized = sanitize_service_name(&name);
            prop_assert!(!sanitized.contains('/'));
            prop_assert_eq!(sanitized.len(), name.len());
        }
    }
}
