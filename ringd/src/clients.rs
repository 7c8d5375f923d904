//! The client table: MAC-addressed entities with their ring binding,
//! addressing, and naming state.
//!
//! The table is a working copy of the `@/clients/<mac>/...` subtree
//! (plus the VPN client subtree). Config events mutate it in place;
//! the DNS responder reads snapshots and individual lookups.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::rings;

/// One known client. All fields other than `mac` are optional because
/// enrollment fills them in over time.
#[derive(Clone, Debug, Default)]
pub struct Client {
    pub mac: String,
    pub ipv4: Option<Ipv4Addr>,
    pub ring: String,
    /// Explicitly assigned DNS name; wins over `friendly_dns`.
    pub dns_name: Option<String>,
    /// Hostname offered by the client in its DHCP request.
    pub dhcp_name: Option<String>,
    /// Human-assigned display name.
    pub friendly_name: Option<String>,
    /// DNS-safe name derived from `friendly_name` by reconciliation.
    pub friendly_dns: Option<String>,
    pub expires: Option<DateTime<Utc>>,
}

impl Client {
    pub fn new(mac: &str) -> Self {
        Client {
            mac: mac.to_string(),
            ..Default::default()
        }
    }

    /// The label this client publishes into the local domain, if any.
    ///
    /// Prefers the explicit `dns_name`; falls back to the derived
    /// `friendly_dns`. Invalid labels and `localhost` never publish.
    pub fn dns_label(&self) -> Option<&str> {
        let label = self
            .dns_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .or(self.friendly_dns.as_deref())?;
        if !valid_dns_label(label) || label.eq_ignore_ascii_case("localhost") {
            return None;
        }
        Some(label)
    }
}

/// A DNS label: 1..=63 chars of [a-z0-9-_], no leading/trailing
/// hyphen. Underscore is tolerated because collision suffixing
/// produces `name_1`-style labels.
pub fn valid_dns_label(label: &str) -> bool {
    if label.is_empty() || label.len() > 63 {
        return false;
    }
    if label.starts_with('-') || label.ends_with('-') {
        return false;
    }
    label
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// A DNS name: dot-separated valid labels, optional trailing dot.
pub fn valid_dns_name(name: &str) -> bool {
    let trimmed = name.strip_suffix('.').unwrap_or(name);
    if trimmed.is_empty() || trimmed.len() > 253 {
        return false;
    }
    trimmed.split('.').all(valid_dns_label)
}

/// Map a human-friendly name to a candidate DNS label: lowercase,
/// whitespace and punctuation collapse to hyphens, everything else
/// non-alphanumeric is dropped.
pub fn friendly_to_dns(name: &str) -> Option<String> {
    let mut label = String::new();
    let mut pending_hyphen = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_hyphen && !label.is_empty() {
                label.push('-');
            }
            pending_hyphen = false;
            label.push(c.to_ascii_lowercase());
        } else if c.is_whitespace() || c == '-' || c == '_' || c == '.' || c == '\'' {
            pending_hyphen = true;
        }
    }
    label.truncate(63);
    while label.ends_with('-') {
        label.pop();
    }
    if valid_dns_label(&label) {
        Some(label)
    } else {
        None
    }
}

/// Mutex-guarded map of enrolled clients plus the VPN fallback table.
pub struct ClientTable {
    clients: Mutex<HashMap<String, Client>>,
    vpn: Mutex<HashMap<String, Client>>,
}

impl ClientTable {
    pub fn new() -> Self {
        ClientTable {
            clients: Mutex::new(HashMap::new()),
            vpn: Mutex::new(HashMap::new()),
        }
    }

    /// Build the table from the current `@/clients/` and VPN subtrees.
    pub fn from_config(tree: &cfgtree::ConfigTree) -> Self {
        let table = ClientTable::new();
        {
            let mut clients = table.clients.lock().unwrap();
            load_subtree(tree, cfgtree::paths::CLIENTS, &mut clients);
        }
        {
            let mut vpn = table.vpn.lock().unwrap();
            load_subtree(tree, cfgtree::paths::VPN_CLIENTS, &mut vpn);
            for client in vpn.values_mut() {
                client.ring = rings::RING_VPN.to_string();
            }
        }
        table
    }

    pub fn len(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Client> {
        self.clients.lock().unwrap().values().cloned().collect()
    }

    pub fn get(&self, mac: &str) -> Option<Client> {
        self.clients.lock().unwrap().get(mac).cloned()
    }

    pub fn by_ip(&self, addr: Ipv4Addr) -> Option<Client> {
        self.clients
            .lock()
            .unwrap()
            .values()
            .find(|client| client.ipv4 == Some(addr))
            .cloned()
    }

    /// VPN fallback lookup; a hit always carries ring `vpn`.
    pub fn vpn_by_ip(&self, addr: Ipv4Addr) -> Option<Client> {
        self.vpn
            .lock()
            .unwrap()
            .values()
            .find(|client| client.ipv4 == Some(addr))
            .cloned()
    }

    pub fn insert(&self, client: Client) {
        self.clients
            .lock()
            .unwrap()
            .insert(client.mac.clone(), client);
    }

    pub fn insert_vpn(&self, mut client: Client) {
        client.ring = rings::RING_VPN.to_string();
        self.vpn.lock().unwrap().insert(client.mac.clone(), client);
    }

    /// Fold one config event into the table. Returns the MAC of the
    /// client affected so the caller can re-derive its DNS records.
    pub fn apply_event(&self, event: &cfgtree::PropEvent) -> Option<String> {
        let parts = cfgtree::paths::split(&event.path);
        match parts.as_slice() {
            ["clients", mac] if event.kind != cfgtree::EventKind::Change => {
                self.clients.lock().unwrap().remove(*mac);
                Some(mac.to_string())
            }
            ["clients", mac, prop] => {
                let mut clients = self.clients.lock().unwrap();
                let client = clients
                    .entry(mac.to_string())
                    .or_insert_with(|| Client::new(mac));
                match event.kind {
                    cfgtree::EventKind::Change => {
                        set_prop(client, prop, event.value.as_deref().unwrap_or(""));
                    }
                    cfgtree::EventKind::Delete | cfgtree::EventKind::Expire => {
                        clear_prop(client, prop);
                    }
                }
                Some(mac.to_string())
            }
            _ => None,
        }
    }
}

impl Default for ClientTable {
    fn default() -> Self {
        Self::new()
    }
}

fn load_subtree(
    tree: &cfgtree::ConfigTree,
    prefix: &str,
    into: &mut HashMap<String, Client>,
) {
    for (path, value) in tree.get_subtree(prefix) {
        let rest = match path.strip_prefix(prefix) {
            Some(rest) => rest,
            None => continue,
        };
        let (mac, prop) = match rest.split_once('/') {
            Some(pair) => pair,
            None => continue,
        };
        if prop.contains('/') {
            continue;
        }
        let client = into
            .entry(mac.to_string())
            .or_insert_with(|| Client::new(mac));
        set_prop(client, prop, &value);
    }
}

fn set_prop(client: &mut Client, prop: &str, value: &str) {
    match prop {
        "ipv4" => client.ipv4 = value.parse().ok(),
        "ring" => client.ring = value.to_string(),
        "dns_name" => client.dns_name = Some(value.to_string()),
        "dhcp_name" => client.dhcp_name = Some(value.to_string()),
        "friendly_name" => client.friendly_name = Some(value.to_string()),
        "friendly_dns" => client.friendly_dns = Some(value.to_string()),
        "lease_expiry" => {
            client.expires = DateTime::parse_from_rfc3339(value)
                .ok()
                .map(|when| when.with_timezone(&Utc))
        }
        _ => {}
    }
}

fn clear_prop(client: &mut Client, prop: &str) {
    match prop {
        "ipv4" => client.ipv4 = None,
        "ring" => client.ring.clear(),
        "dns_name" => client.dns_name = None,
        "dhcp_name" => client.dhcp_name = None,
        "friendly_name" => client.friendly_name = None,
        "friendly_dns" => client.friendly_dns = None,
        "lease_expiry" => client.expires = None,
        _ => {}
    }
}
