//! Ring topology: ordered trust zones, their subnets and interfaces,
//! and the local-DNS visibility policy between them.
//!
//! Rings are loaded from the `@/rings/<name>/{subnet,iface}` subtree at
//! startup and are static for the process lifetime; a topology change
//! arrives as a config event and is handled by restarting the affected
//! subsystem, not by mutating a live `RingMap`.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::error::app::{AppError, Result};

pub const RING_CORE: &str = "core";
pub const RING_INTERNAL: &str = "internal";
pub const RING_STANDARD: &str = "standard";
pub const RING_DEVICES: &str = "devices";
pub const RING_GUEST: &str = "guest";
pub const RING_UNENROLLED: &str = "unenrolled";
pub const RING_QUARANTINE: &str = "quarantine";
pub const RING_VPN: &str = "vpn";

/// Trust ordering of the well-known rings; lower is more privileged.
const RING_LEVELS: &[(&str, u32)] = &[
    (RING_CORE, 0),
    (RING_INTERNAL, 1),
    (RING_STANDARD, 2),
    (RING_DEVICES, 3),
    (RING_GUEST, 4),
    (RING_UNENROLLED, 5),
    (RING_QUARANTINE, 6),
    (RING_VPN, 7),
];

/// Which rings' local records each source ring may resolve.
///
/// Asymmetric and deliberately not transitive. `quarantine` has no
/// source row: local lookups from quarantined clients always miss.
const VISIBILITY: &[(&str, &[&str])] = &[
    (
        RING_CORE,
        &[
            RING_CORE,
            RING_INTERNAL,
            RING_STANDARD,
            RING_DEVICES,
            RING_GUEST,
            RING_UNENROLLED,
            RING_VPN,
        ],
    ),
    (
        RING_INTERNAL,
        &[
            RING_CORE,
            RING_INTERNAL,
            RING_STANDARD,
            RING_DEVICES,
            RING_GUEST,
            RING_UNENROLLED,
            RING_VPN,
        ],
    ),
    (
        RING_STANDARD,
        &[RING_CORE, RING_INTERNAL, RING_STANDARD, RING_DEVICES, RING_VPN],
    ),
    (RING_DEVICES, &[RING_CORE, RING_STANDARD, RING_DEVICES]),
    (RING_GUEST, &[RING_GUEST]),
    (RING_UNENROLLED, &[RING_UNENROLLED]),
    (RING_VPN, &[RING_CORE, RING_STANDARD, RING_DEVICES, RING_VPN]),
];

/// Reserved short names answered per querying ring rather than from
/// the host map.
pub const PER_RING_HOSTS: &[&str] = &["gateway", "phishing", "malware", "captive"];

/// Rings whose external queries are subject to blocklist rewriting.
const PHISHING_RINGS: &[&str] = &[RING_DEVICES, RING_UNENROLLED, RING_QUARANTINE];

pub fn ring_level(name: &str) -> Option<u32> {
    RING_LEVELS
        .iter()
        .find(|(ring, _)| *ring == name)
        .map(|(_, level)| *level)
}

pub fn visible_rings(source: &str) -> Option<&'static [&'static str]> {
    VISIBILITY
        .iter()
        .find(|(ring, _)| *ring == source)
        .map(|(_, targets)| *targets)
}

/// Whether a client in `source` may see a local record owned by
/// `target`.
pub fn can_see(source: &str, target: &str) -> bool {
    visible_rings(source)
        .map(|targets| targets.contains(&target))
        .unwrap_or(false)
}

pub fn is_per_ring_host(name: &str) -> bool {
    PER_RING_HOSTS.contains(&name)
}

pub fn phishing_ruled(ring: &str) -> bool {
    PHISHING_RINGS.contains(&ring)
}

/// One security zone: a named subnet bound to a network interface.
#[derive(Clone, Debug)]
pub struct Ring {
    pub name: String,
    pub level: u32,
    pub subnet: Ipv4Net,
    pub iface: String,
}

impl Ring {
    /// The appliance's own address on this ring, which doubles as the
    /// answer for per-ring hosts: the first host of the subnet.
    pub fn router(&self) -> Ipv4Addr {
        self.subnet
            .hosts()
            .next()
            .unwrap_or_else(|| self.subnet.addr())
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.subnet.contains(&addr)
    }
}

/// The full ring topology, keyed by ring name.
pub struct RingMap {
    rings: BTreeMap<String, Ring>,
}

impl RingMap {
    /// Load rings from `@/rings/<name>/{subnet,iface}`. A ring whose
    /// subnet fails to parse is skipped with a warning; an empty
    /// topology is a fatal startup error.
    pub fn from_config(tree: &cfgtree::ConfigTree) -> Result<RingMap> {
        let mut rings = BTreeMap::new();
        let subtree = tree.get_subtree(cfgtree::paths::RINGS);

        for (path, value) in &subtree {
            let parts = cfgtree::paths::split(path);
            let (name, prop) = match parts.as_slice() {
                ["rings", name, prop] => (*name, *prop),
                _ => continue,
            };
            if prop != "subnet" {
                continue;
            }
            let level = match ring_level(name) {
                Some(level) => level,
                None => {
                    log::warn!("ignoring unknown ring {}", name);
                    continue;
                }
            };
            let subnet: Ipv4Net = match value.parse() {
                Ok(subnet) => subnet,
                Err(err) => {
                    log::warn!("ring {}: bad subnet {:?}: {}", name, value, err);
                    continue;
                }
            };
            let iface = tree
                .get(&cfgtree::paths::ring_prop(name, "iface"))
                .unwrap_or_default();
            rings.insert(
                name.to_string(),
                Ring {
                    name: name.to_string(),
                    level,
                    subnet,
                    iface,
                },
            );
        }

        if rings.is_empty() {
            return Err(AppError::config_error("no rings configured"));
        }
        Ok(RingMap { rings })
    }

    #[cfg(test)]
    pub fn from_rings(rings: Vec<Ring>) -> RingMap {
        RingMap {
            rings: rings
                .into_iter()
                .map(|ring| (ring.name.clone(), ring))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Ring> {
        self.rings.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Ring> {
        self.rings.values()
    }

    pub fn len(&self) -> usize {
        self.rings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rings.is_empty()
    }

    /// The ring whose subnet contains `addr`.
    pub fn ring_for_ip(&self, addr: Ipv4Addr) -> Option<&Ring> {
        self.rings.values().find(|ring| ring.contains(addr))
    }

    /// Whether `addr` is one of the appliance's own per-ring router
    /// addresses.
    pub fn is_local_address(&self, addr: Ipv4Addr) -> bool {
        addr.is_loopback() || self.rings.values().any(|ring| ring.router() == addr)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_is_first_host() {
        let ring = Ring {
            name: RING_STANDARD.to_string(),
            level: 2,
            subnet: "192.168.10.0/24".parse().unwrap(),
            iface: "brvlan10".to_string(),
        };
        assert_eq!(ring.router(), Ipv4Addr::new(192, 168, 10, 1));
    }

    #[test]
    fn visibility_is_asymmetric() {
        assert!(can_see(RING_CORE, RING_STANDARD));
        assert!(!can_see(RING_GUEST, RING_STANDARD));
        assert!(can_see(RING_GUEST, RING_GUEST));
        assert!(can_see(RING_DEVICES, RING_STANDARD));
        assert!(!can_see(RING_DEVICES, RING_GUEST));
    }

    #[test]
    fn quarantine_has_no_source_row() {
        assert!(visible_rings(RING_QUARANTINE).is_none());
        assert!(!can_see(RING_QUARANTINE, RING_QUARANTINE));
    }

    #[test]
    fn phishing_rings_match_policy() {
        assert!(phishing_ruled(RING_DEVICES));
        assert!(phishing_ruled(RING_UNENROLLED));
        assert!(phishing_ruled(RING_QUARANTINE));
        assert!(!phishing_ruled(RING_STANDARD));
        assert!(!phishing_ruled(RING_CORE));
    }

    #[test]
    fn ring_for_ip_matches_subnet() {
        let rings = testutil::test_rings();
        assert_eq!(
            rings
                .ring_for_ip(Ipv4Addr::new(192, 168, 20, 44))
                .map(|r| r.name.as_str()),
            Some(RING_DEVICES)
        );
        assert!(rings.ring_for_ip(Ipv4Addr::new(10, 0, 0, 1)).is_none());
    }

    #[test]
    fn local_addresses_are_ring_routers() {
        let rings = testutil::test_rings();
        assert!(rings.is_local_address(Ipv4Addr::new(192, 168, 10, 1)));
        assert!(rings.is_local_address(Ipv4Addr::LOCALHOST));
        assert!(!rings.is_local_address(Ipv4Addr::new(192, 168, 10, 2)));
    }
}
