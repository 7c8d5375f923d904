//! Authoritative data for the local domain.
//!
//! The host map stores A, PTR, and CNAME records keyed by lowercase
//! FQDN. Client records are derived in pairs (forward A plus reverse
//! PTR) and obey per-MAC uniqueness: re-deriving a client's records
//! replaces whatever that MAC published before.
//!
//! A second, static mapping answers the reserved per-ring host names
//! (`gateway`, `phishing`, `malware`, `captive`): the answer depends
//! on the querying ring, not on the host map contents.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use crate::clients::Client;
use crate::rings::{self, RingMap};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordKind {
    A(Ipv4Addr),
    Cname(String),
    Ptr(String),
}

/// One authoritative record. Records are equal only when every field
/// matches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DnsRecord {
    /// Lowercase FQDN with trailing dot.
    pub name: String,
    /// Owning client MAC; empty for administrative records.
    pub mac: String,
    /// Owning ring; empty means visible to every ring.
    pub ring: String,
    pub kind: RecordKind,
}

pub struct HostMap {
    domain: String,
    hosts: Mutex<HashMap<String, DnsRecord>>,
    /// ring name → per-ring host short name → record.
    ring_hosts: HashMap<String, HashMap<String, DnsRecord>>,
}

impl HostMap {
    /// `domain` is the local domain as a lowercase FQDN with trailing
    /// dot (`example.local.`).
    pub fn new(domain: &str, rings: &RingMap) -> Self {
        let mut ring_hosts = HashMap::new();
        for ring in rings.iter() {
            let mut per_ring = HashMap::new();
            for short in rings::PER_RING_HOSTS {
                per_ring.insert(
                    short.to_string(),
                    DnsRecord {
                        name: format!("{}.{}", short, domain),
                        mac: String::new(),
                        ring: ring.name.clone(),
                        kind: RecordKind::A(ring.router()),
                    },
                );
            }
            ring_hosts.insert(ring.name.clone(), per_ring);
        }
        HostMap {
            domain: domain.to_string(),
            hosts: Mutex::new(HashMap::new()),
            ring_hosts,
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Lowercase a query name and anchor it in the local domain:
    /// `laptop` and `laptop.` both become `laptop.example.local.`.
    pub fn qualify(&self, name: &str) -> String {
        let mut name = name.to_ascii_lowercase();
        if !name.ends_with('.') {
            name.push('.');
        }
        if name == self.domain || name.ends_with(&format!(".{}", self.domain)) {
            name
        } else {
            format!("{}{}", name, self.domain)
        }
    }

    /// The per-ring-host short name of a qualified name, if it has
    /// one: `gateway.example.local.` → `gateway`.
    pub fn per_ring_short(&self, qualified: &str) -> Option<String> {
        let short = qualified
            .strip_suffix(&self.domain)?
            .trim_end_matches('.')
            .to_string();
        if rings::is_per_ring_host(&short) {
            Some(short)
        } else {
            None
        }
    }

    /// The substitute record for a per-ring host as seen from `ring`.
    pub fn per_ring_record(&self, ring: &str, short: &str) -> Option<DnsRecord> {
        self.ring_hosts.get(ring)?.get(short).cloned()
    }

    pub fn lookup(&self, name: &str) -> Option<DnsRecord> {
        self.hosts.lock().unwrap().get(name).cloned()
    }

    /// Look up subject to the ring-visibility matrix; an invisible
    /// record reads as a miss.
    pub fn visible_lookup(&self, name: &str, source_ring: &str) -> Option<DnsRecord> {
        self.lookup(name).filter(|record| {
            record.ring.is_empty() || rings::can_see(source_ring, &record.ring)
        })
    }

    pub fn len(&self) -> usize {
        self.hosts.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Derive and install this client's A and PTR records, replacing
    /// anything the MAC published before. A client with no publishable
    /// label or no address simply ends up with no records.
    pub fn set_client_records(&self, client: &Client) {
        let mut hosts = self.hosts.lock().unwrap();
        hosts.retain(|_, record| record.mac != client.mac);

        let label = match client.dns_label() {
            Some(label) => label.to_ascii_lowercase(),
            None => return,
        };
        let addr = match client.ipv4 {
            Some(addr) => addr,
            None => return,
        };
        if client.ring.is_empty() {
            return;
        }

        let fqdn = format!("{}.{}", label, self.domain);
        hosts.insert(
            fqdn.clone(),
            DnsRecord {
                name: fqdn.clone(),
                mac: client.mac.clone(),
                ring: client.ring.clone(),
                kind: RecordKind::A(addr),
            },
        );
        let reverse = reverse_name(addr);
        hosts.insert(
            reverse.clone(),
            DnsRecord {
                name: reverse,
                mac: client.mac.clone(),
                ring: client.ring.clone(),
                kind: RecordKind::Ptr(fqdn),
            },
        );
    }

    pub fn remove_mac(&self, mac: &str) {
        self.hosts
            .lock()
            .unwrap()
            .retain(|_, record| record.mac != mac);
    }

    /// Install an administrative CNAME; both sides are anchored in the
    /// local domain.
    pub fn set_cname(&self, alias: &str, target: &str) {
        let alias = self.qualify(alias);
        let target = self.qualify(target);
        self.hosts.lock().unwrap().insert(
            alias.clone(),
            DnsRecord {
                name: alias,
                mac: String::new(),
                ring: String::new(),
                kind: RecordKind::Cname(target),
            },
        );
    }

    pub fn remove_cname(&self, alias: &str) {
        let alias = self.qualify(alias);
        let mut hosts = self.hosts.lock().unwrap();
        if matches!(
            hosts.get(&alias),
            Some(DnsRecord {
                kind: RecordKind::Cname(_),
                ..
            })
        ) {
            hosts.remove(&alias);
        }
    }
}

/// `192.168.10.5` → `5.10.168.192.in-addr.arpa.`
pub fn reverse_name(addr: Ipv4Addr) -> String {
    let octets = addr.octets();
    format!(
        "{}.{}.{}.{}.in-addr.arpa.",
        octets[3], octets[2], octets[1], octets[0]
    )
}

/// Decode a reverse-lookup name back to the address it describes.
pub fn parse_reverse(name: &str) -> Option<Ipv4Addr> {
    let rest = name
        .to_ascii_lowercase()
        .strip_suffix(".in-addr.arpa.")
        .map(str::to_string)?;
    let mut octets: Vec<u8> = Vec::with_capacity(4);
    for part in rest.split('.') {
        octets.push(part.parse().ok()?);
    }
    if octets.len() != 4 {
        return None;
    }
    Some(Ipv4Addr::new(octets[3], octets[2], octets[1], octets[0]))
}
