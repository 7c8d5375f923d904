//! The recursive DNS responder.
//!
//! Serves UDP:53 and TCP:53 through one `hickory_server::ServerFuture`.
//! Each query is classified (local, hostname-only, reverse, external),
//! attributed to a requestor by source address, and answered from the
//! host map, the per-ring records, the blocklist rewrite, or the
//! upstream cache — in that order of preference. Configuration events
//! re-point the upstream, the search domain, the CNAME set, and the
//! blocklist at runtime; a site-id change restarts the whole process.

pub mod blocklist;
pub mod cache;
pub mod handler;
pub mod hosts;
pub mod names;
pub mod upstream;
pub mod warn;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hickory_server::server::ServerFuture;

use crate::clients::{valid_dns_name, ClientTable};
use crate::error::app::{AppError, Result};
use crate::events::EventSink;
use crate::rings::RingMap;

use blocklist::Blocklist;
use cache::ResponseCache;
use handler::DnsHandler;
use hosts::HostMap;
use upstream::{Forwarder, Upstream};
use warn::{ThrottledLog, WarningLog};

/// TCP connections idle longer than this are dropped by the server.
const TCP_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Upstream-failure log lines are limited to one per this window.
const UPSTREAM_WARN_INTERVAL: Duration = Duration::from_secs(600);

pub struct DnsOptions {
    /// TTL on answers synthesized from the host map.
    pub local_ttl: u32,
    /// Cache byte budget; zero disables caching entirely.
    pub cache_budget: usize,
    /// Blocklist file, if one is deployed.
    pub blocklist: Option<PathBuf>,
}

impl Default for DnsOptions {
    fn default() -> Self {
        DnsOptions {
            local_ttl: 300,
            cache_budget: 1 << 20,
            blocklist: None,
        }
    }
}

pub struct DnsResponder {
    pub(crate) domain: String,
    pub(crate) local_ttl: u32,
    pub(crate) cache_budget: usize,
    pub(crate) rings: Arc<RingMap>,
    pub(crate) clients: Arc<ClientTable>,
    pub(crate) hosts: HostMap,
    pub(crate) cache: Mutex<ResponseCache>,
    pub(crate) upstream: Mutex<Option<Upstream>>,
    pub(crate) search_domain: Mutex<Option<String>>,
    /// domain (trailing dot) → ring → VPN-routed DNS server.
    pub(crate) vpn_dns: Mutex<HashMap<String, HashMap<String, SocketAddr>>>,
    pub(crate) blocklist: Blocklist,
    pub(crate) warnings: WarningLog,
    pub(crate) upstream_failures: ThrottledLog,
    pub(crate) forwarder: Forwarder,
    pub(crate) sink: Arc<dyn EventSink>,
}

impl DnsResponder {
    /// Build the responder from the current configuration. The site id
    /// must exist (the local domain derives from it); everything else
    /// degrades to an empty setting.
    pub fn new(
        tree: &cfgtree::ConfigTree,
        rings: Arc<RingMap>,
        clients: Arc<ClientTable>,
        sink: Arc<dyn EventSink>,
        options: DnsOptions,
    ) -> Result<DnsResponder> {
        let siteid = tree
            .get(cfgtree::paths::SITE_ID)
            .ok_or_else(|| AppError::fatal("no site id configured"))?;
        let domain = format!("{}.local.", siteid.trim().to_ascii_lowercase());
        log::info!("local domain {}", domain);

        let hosts = HostMap::new(&domain, &rings);
        for client in clients.snapshot() {
            hosts.set_client_records(&client);
        }
        for (path, target) in tree.get_subtree(cfgtree::paths::DNS_CNAMES) {
            if let Some(alias) = cfgtree::paths::cname_of(&path) {
                hosts.set_cname(alias, &target);
            }
        }

        let upstream = match tree.get(cfgtree::paths::DNS_SERVER) {
            Some(spec) => match Upstream::parse(&spec) {
                Ok(upstream) => Some(upstream),
                Err(err) => {
                    log::error!("bad upstream {:?}: {}", spec, err);
                    None
                }
            },
            None => None,
        };

        let search_domain = tree
            .get(cfgtree::paths::DNS_SEARCH)
            .and_then(|value| normalize_search_domain(&value));

        let blocklist = match &options.blocklist {
            Some(path) => Blocklist::from_file(path),
            None => Blocklist::empty(),
        };

        let responder = DnsResponder {
            domain,
            local_ttl: options.local_ttl,
            cache_budget: options.cache_budget,
            rings,
            clients,
            hosts,
            cache: Mutex::new(ResponseCache::new(options.cache_budget)),
            upstream: Mutex::new(upstream),
            search_domain: Mutex::new(search_domain),
            vpn_dns: Mutex::new(load_vpn_dns(tree)),
            blocklist,
            warnings: WarningLog::new(),
            upstream_failures: ThrottledLog::new(UPSTREAM_WARN_INTERVAL),
            forwarder: Forwarder::new()?,
            sink,
        };
        Ok(responder)
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Point at a new upstream (or none). The cache is dropped with
    /// the old upstream.
    pub fn set_upstream(&self, spec: Option<&str>) {
        let parsed = match spec {
            Some(spec) => match Upstream::parse(spec) {
                Ok(upstream) => {
                    log::info!("upstream dns server {}", upstream);
                    Some(upstream)
                }
                Err(err) => {
                    log::error!("bad upstream {:?}: {}", spec, err);
                    None
                }
            },
            None => None,
        };
        *self.upstream.lock().unwrap() = parsed;
        self.cache.lock().unwrap().clear();
    }

    pub fn set_search_domain(&self, value: Option<&str>) {
        let normalized = value.and_then(normalize_search_domain);
        if value.is_some() && normalized.is_none() {
            log::error!("invalid search domain {:?}", value.unwrap_or_default());
        }
        *self.search_domain.lock().unwrap() = normalized;
    }

    /// The upstream for one query: a VPN-routed server bound to both
    /// the question's domain and the requestor's ring wins over the
    /// global setting.
    pub(crate) fn select_upstream(&self, qname: &str, ring: &str) -> Option<Upstream> {
        if let Some((_, domain)) = qname.split_once('.') {
            if !domain.is_empty() {
                if let Some(server) = self
                    .vpn_dns
                    .lock()
                    .unwrap()
                    .get(domain)
                    .and_then(|rings| rings.get(ring))
                {
                    return Some(Upstream::Plain(*server));
                }
            }
        }
        self.upstream.lock().unwrap().clone()
    }

    /// Re-derive the host-map records of one client after its table
    /// entry changed.
    pub fn refresh_client(&self, mac: &str) {
        match self.clients.get(mac) {
            Some(client) => self.hosts.set_client_records(&client),
            None => self.hosts.remove_mac(mac),
        }
    }

    /// Run the UDP and TCP listeners until one of them fails; a
    /// listener failure is fatal to the caller.
    pub async fn serve(
        self: &Arc<Self>,
        udp_addr: SocketAddr,
        tcp_addr: SocketAddr,
    ) -> std::io::Result<()> {
        let mut server = ServerFuture::new(DnsHandler::new(Arc::clone(self)));
        server.register_socket(tokio::net::UdpSocket::bind(udp_addr).await?);
        server.register_listener(
            tokio::net::TcpListener::bind(tcp_addr).await?,
            TCP_QUERY_TIMEOUT,
        );
        log::info!("dns responder on {} (udp) / {} (tcp)", udp_addr, tcp_addr);
        server.block_until_done().await.map_err(std::io::Error::other)
    }

    /// Consume configuration events until the tree goes away.
    pub async fn watch_config(self: Arc<Self>, tree: Arc<cfgtree::ConfigTree>) {
        let mut events = tree.watch();
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    log::warn!("config watcher lagged, {} events lost", missed);
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            };
            self.apply_config_event(&event);
        }
    }

    fn apply_config_event(&self, event: &cfgtree::PropEvent) {
        use cfgtree::EventKind;

        let path = event.path.as_str();
        if path == cfgtree::paths::SITE_ID && event.kind == EventKind::Change {
            // The local domain just changed under us; restart clean.
            log::warn!("site id changed, exiting for restart");
            std::process::exit(0);
        }

        if let Some(alias) = cfgtree::paths::cname_of(path) {
            match event.kind {
                EventKind::Change => {
                    if let Some(target) = event.value.as_deref() {
                        self.hosts.set_cname(alias, target);
                    }
                }
                EventKind::Delete | EventKind::Expire => self.hosts.remove_cname(alias),
            }
            return;
        }

        match (path, event.kind) {
            (cfgtree::paths::DNS_SERVER, EventKind::Change) => {
                self.set_upstream(event.value.as_deref());
            }
            (cfgtree::paths::DNS_SERVER, _) => self.set_upstream(None),
            (cfgtree::paths::DNS_SEARCH, EventKind::Change) => {
                self.set_search_domain(event.value.as_deref());
            }
            (cfgtree::paths::DNS_SEARCH, _) => self.set_search_domain(None),
            ("@/network/dns", EventKind::Delete) => {
                self.set_upstream(None);
                self.set_search_domain(None);
            }
            _ => {
                if is_blocklist_update(path) && event.kind == EventKind::Change {
                    self.blocklist.reload();
                } else if path.starts_with(cfgtree::paths::CLIENTS) {
                    if let Some(mac) = self.clients.apply_event(event) {
                        self.refresh_client(&mac);
                    }
                }
            }
        }
    }
}

/// `@/updates/dns_*list` markers signal a new blocklist deployment.
fn is_blocklist_update(path: &str) -> bool {
    path.strip_prefix(cfgtree::paths::UPDATES)
        .map(|rest| rest.starts_with("dns_") && rest.ends_with("list"))
        .unwrap_or(false)
}

fn normalize_search_domain(value: &str) -> Option<String> {
    let value = value.trim().to_ascii_lowercase();
    if !valid_dns_name(&value) {
        return None;
    }
    if value.ends_with('.') {
        Some(value)
    } else {
        Some(format!("{}.", value))
    }
}

fn load_vpn_dns(tree: &cfgtree::ConfigTree) -> HashMap<String, HashMap<String, SocketAddr>> {
    let mut table: HashMap<String, HashMap<String, SocketAddr>> = HashMap::new();
    for (path, value) in tree.get_subtree(cfgtree::paths::VPN_DNS) {
        let rest = match path.strip_prefix(cfgtree::paths::VPN_DNS) {
            Some(rest) => rest,
            None => continue,
        };
        let (domain, ring) = match rest.split_once('/') {
            Some(pair) => pair,
            None => continue,
        };
        let server: std::net::IpAddr = match value.parse() {
            Ok(addr) => addr,
            Err(err) => {
                log::warn!("vpn dns {}: bad address {:?}: {}", path, value, err);
                continue;
            }
        };
        let key = format!("{}.", domain.trim_end_matches('.').to_ascii_lowercase());
        table
            .entry(key)
            .or_default()
            .insert(ring.to_string(), SocketAddr::new(server, 53));
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocklist_update_paths() {
        assert!(is_blocklist_update("@/updates/dns_blocklist"));
        assert!(is_blocklist_update("@/updates/dns_allowlist"));
        assert!(!is_blocklist_update("@/updates/firmware"));
        assert!(!is_blocklist_update("@/network/dns/server"));
    }

    #[test]
    fn search_domain_normalization() {
        assert_eq!(
            normalize_search_domain("Corp.Example.COM"),
            Some("corp.example.com.".to_string())
        );
        assert_eq!(
            normalize_search_domain("corp.example.com."),
            Some("corp.example.com.".to_string())
        );
        assert_eq!(normalize_search_domain("not a name"), None);
    }

    #[test]
    fn vpn_dns_table_is_keyed_by_domain_then_ring() {
        let tree = cfgtree::ConfigTree::new();
        tree.set("@/network/vpn/dns/corp.example.com/standard", "10.8.0.1", None);
        tree.set("@/network/vpn/dns/corp.example.com/vpn", "10.8.0.2", None);
        tree.set("@/network/vpn/dns/bad.example.com/vpn", "not-an-ip", None);

        let table = load_vpn_dns(&tree);
        let corp = table.get("corp.example.com.").unwrap();
        assert_eq!(
            corp.get("standard"),
            Some(&"10.8.0.1:53".parse().unwrap())
        );
        assert!(table.get("bad.example.com.").is_none());
    }
}
