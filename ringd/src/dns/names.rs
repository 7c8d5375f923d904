//! Friendly-name reconciliation.
//!
//! Clients carry a human-assigned `friendly_name` ("Nora's MacBook
//! Pro") and publish into DNS through a derived `friendly_dns` label.
//! Reconciliation runs at startup and on demand: derive a candidate
//! label for every named client, de-collide with `_1`, `_2`, ...
//! suffixes, and write the result back to the config tree. The write
//! returns through the watcher, which updates the client table and the
//! host map.

use std::collections::HashSet;

use crate::clients::{friendly_to_dns, ClientTable};

/// Reconcile every client; returns how many tree writes were made.
pub fn reconcile(tree: &cfgtree::ConfigTree, clients: &ClientTable) -> usize {
    let mut snapshot = clients.snapshot();
    snapshot.sort_by(|a, b| a.mac.cmp(&b.mac));

    // Labels already spoken for: manual names and current derived
    // names alike.
    let mut taken: HashSet<String> = HashSet::new();
    for client in &snapshot {
        if let Some(name) = client.dns_name.as_deref().filter(|name| !name.is_empty()) {
            taken.insert(name.to_ascii_lowercase());
        }
        if let Some(name) = client.friendly_dns.as_deref().filter(|name| !name.is_empty()) {
            taken.insert(name.to_ascii_lowercase());
        }
    }

    let mut writes = 0;
    for client in &snapshot {
        let friendly = client
            .friendly_name
            .as_deref()
            .map(str::trim)
            .unwrap_or("");
        if friendly.is_empty() {
            if client.friendly_dns.is_some() {
                tree.delete(&cfgtree::paths::client_prop(&client.mac, "friendly_dns"));
                writes += 1;
            }
            continue;
        }

        let base = match friendly_to_dns(friendly) {
            Some(base) => base,
            None => {
                log::warn!(
                    "client {}: friendly name {:?} yields no usable label",
                    client.mac,
                    friendly
                );
                continue;
            }
        };
        if is_current(client.friendly_dns.as_deref(), &base) {
            continue;
        }

        let mut candidate = base.clone();
        let mut suffix = 0u32;
        while taken.contains(&candidate) {
            suffix += 1;
            candidate = format!("{}_{}", base, suffix);
        }
        taken.insert(candidate.clone());

        log::info!("client {}: friendly_dns {}", client.mac, candidate);
        tree.set(
            &cfgtree::paths::client_prop(&client.mac, "friendly_dns"),
            &candidate,
            None,
        );
        writes += 1;
    }
    writes
}

/// A stored label is current if it is the candidate itself or a
/// suffixed form of it; renaming those would churn names on every
/// pass.
fn is_current(stored: Option<&str>, base: &str) -> bool {
    match stored {
        Some(stored) if stored == base => true,
        Some(stored) => stored
            .strip_prefix(&format!("{}_", base))
            .map(|suffix| !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()))
            .unwrap_or(false),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::Client;

    fn named(mac: &str, friendly: Option<&str>, friendly_dns: Option<&str>) -> Client {
        let mut client = Client::new(mac);
        client.friendly_name = friendly.map(str::to_string);
        client.friendly_dns = friendly_dns.map(str::to_string);
        client
    }

    #[test]
    fn derives_labels_for_named_clients() {
        let tree = cfgtree::ConfigTree::new();
        let clients = ClientTable::new();
        clients.insert(named("aa:00", Some("Nora's MacBook Pro"), None));

        assert_eq!(reconcile(&tree, &clients), 1);
        assert_eq!(
            tree.get("@/clients/aa:00/friendly_dns"),
            Some("noras-macbook-pro".to_string())
        );
    }

    #[test]
    fn collisions_get_numeric_suffixes() {
        let tree = cfgtree::ConfigTree::new();
        let clients = ClientTable::new();
        clients.insert(named("aa:00", Some("Printer"), None));
        clients.insert(named("aa:01", Some("Printer"), None));
        let mut manual = Client::new("aa:02");
        manual.dns_name = Some("printer_1".to_string());
        clients.insert(manual);

        assert_eq!(reconcile(&tree, &clients), 2);
        assert_eq!(
            tree.get("@/clients/aa:00/friendly_dns"),
            Some("printer".to_string())
        );
        // printer_1 is manually assigned, so the second Printer lands
        // on printer_2.
        assert_eq!(
            tree.get("@/clients/aa:01/friendly_dns"),
            Some("printer_2".to_string())
        );
    }

    #[test]
    fn unnamed_clients_lose_their_derived_label() {
        let tree = cfgtree::ConfigTree::new();
        tree.set("@/clients/aa:00/friendly_dns", "stale", None);
        let clients = ClientTable::new();
        clients.insert(named("aa:00", None, Some("stale")));

        assert_eq!(reconcile(&tree, &clients), 1);
        assert_eq!(tree.get("@/clients/aa:00/friendly_dns"), None);
    }

    #[test]
    fn current_labels_are_left_alone() {
        let tree = cfgtree::ConfigTree::new();
        let clients = ClientTable::new();
        clients.insert(named("aa:00", Some("Printer"), Some("printer_1")));

        assert_eq!(reconcile(&tree, &clients), 0);
        assert_eq!(tree.get("@/clients/aa:00/friendly_dns"), None);
    }

    #[test]
    fn suffix_detection() {
        assert!(is_current(Some("printer"), "printer"));
        assert!(is_current(Some("printer_3"), "printer"));
        assert!(!is_current(Some("printer_x"), "printer"));
        assert!(!is_current(Some("scanner"), "printer"));
        assert!(!is_current(None, "printer"));
    }
}
