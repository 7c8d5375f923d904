//! Well-known property paths.
//!
//! Path constants end without a trailing slash; prefix constants used
//! for subtree scans end with one.

/// Site identifier; the local DNS domain is derived from it.
pub const SITE_ID: &str = "@/siteid";
/// Upstream DNS server (URL for DoH, `ip[:port]` for plain DNS).
pub const DNS_SERVER: &str = "@/network/dns/server";
/// DNS search domain appended to bare hostnames.
pub const DNS_SEARCH: &str = "@/network/dns/search";
/// Locally-administered CNAME records.
pub const DNS_CNAMES: &str = "@/dns/cnames/";
/// Blocklist update markers (`dns_blocklist`, `dns_allowlist`, ...).
pub const UPDATES: &str = "@/updates/";
/// Per-client subtree root.
pub const CLIENTS: &str = "@/clients/";
/// Ring topology subtree root.
pub const RINGS: &str = "@/rings/";
/// Per-(domain, ring) VPN DNS overrides.
pub const VPN_DNS: &str = "@/network/vpn/dns/";
/// VPN-attached client subtree root.
pub const VPN_CLIENTS: &str = "@/network/vpn/clients/";
/// Firewall rule subtree root.
pub const FIREWALL_RULES: &str = "@/firewall/rules/";

/// Split a path into its components, dropping the `@/` root.
///
/// `split("@/clients/aa:bb/ring")` yields `["clients", "aa:bb", "ring"]`.
pub fn split(path: &str) -> Vec<&str> {
    path.trim_start_matches("@/")
        .split('/')
        .filter(|part| !part.is_empty())
        .collect()
}

/// Build the path of one property of one client.
pub fn client_prop(mac: &str, prop: &str) -> String {
    format!("{}{}/{}", CLIENTS, mac, prop)
}

/// Build the path of one ring attribute.
pub fn ring_prop(ring: &str, prop: &str) -> String {
    format!("{}{}/{}", RINGS, ring, prop)
}

/// The CNAME name addressed by a `@/dns/cnames/<name>` path, if the
/// path is of that form.
pub fn cname_of(path: &str) -> Option<&str> {
    path.strip_prefix(DNS_CNAMES)
        .filter(|rest| !rest.is_empty() && !rest.contains('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_drops_root_and_empties() {
        assert_eq!(
            split("@/clients/aa:bb:cc:dd:ee:ff/ring"),
            vec!["clients", "aa:bb:cc:dd:ee:ff", "ring"]
        );
        assert_eq!(split("@/siteid"), vec!["siteid"]);
    }

    #[test]
    fn cname_path_parsing() {
        assert_eq!(cname_of("@/dns/cnames/www"), Some("www"));
        assert_eq!(cname_of("@/dns/cnames/"), None);
        assert_eq!(cname_of("@/dns/cnames/a/b"), None);
        assert_eq!(cname_of("@/network/dns/server"), None);
    }
}
