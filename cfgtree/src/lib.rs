//! Client-side view of the appliance configuration store.
//!
//! The store is a tree of string properties addressed by `@/`-rooted
//! slash-separated paths (`@/siteid`, `@/clients/<mac>/ring`, ...).
//! Consumers read and write properties and subscribe to a broadcast
//! stream of [`PropEvent`]s describing changes, deletions, and lease
//! expirations. Watchers receive every event and filter by path prefix
//! themselves; the store does not fan out per-prefix.
//!
//! `ConfigTree` here is the in-process implementation of that
//! contract. It holds the daemon's working copy of the tree and is the
//! seam through which an external store would be attached.

/// Well-known property paths and path manipulation helpers.
pub mod paths;

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

/// Capacity of the watch broadcast channel. A lagging watcher loses
/// events rather than blocking writers.
const WATCH_CHANNEL_DEPTH: usize = 256;

/// The kind of mutation a [`PropEvent`] describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// A property was created or its value replaced.
    Change,
    /// A property was removed.
    Delete,
    /// A property's lease expired and it was removed by the sweeper.
    Expire,
}

/// A single mutation of the configuration tree, delivered to watchers.
#[derive(Clone, Debug)]
pub struct PropEvent {
    pub path: String,
    pub kind: EventKind,
    /// The new value for `Change` events; `None` for deletes/expires.
    pub value: Option<String>,
}

/// A stored property: a string value with an optional expiry.
#[derive(Clone, Debug)]
pub struct PropValue {
    pub value: String,
    pub expires: Option<DateTime<Utc>>,
}

/// In-process property tree with watch support.
///
/// All access goes through the internal mutex; lock scope is a single
/// operation, so callers may hold references to this from many tasks.
pub struct ConfigTree {
    props: Mutex<BTreeMap<String, PropValue>>,
    watchers: broadcast::Sender<PropEvent>,
}

impl ConfigTree {
    pub fn new() -> Self {
        let (watchers, _) = broadcast::channel(WATCH_CHANNEL_DEPTH);
        ConfigTree {
            props: Mutex::new(BTreeMap::new()),
            watchers,
        }
    }

    /// Subscribe to the mutation stream. Events sent before the call
    /// are not replayed.
    pub fn watch(&self) -> broadcast::Receiver<PropEvent> {
        self.watchers.subscribe()
    }

    /// Fetch a property value, treating an expired property as absent.
    pub fn get(&self, path: &str) -> Option<String> {
        let props = self.props.lock().unwrap();
        props.get(path).and_then(|prop| {
            if prop
                .expires
                .map(|expiry| expiry <= Utc::now())
                .unwrap_or(false)
            {
                None
            } else {
                Some(prop.value.clone())
            }
        })
    }

    /// Return every live property under `prefix` (inclusive), keyed by
    /// full path.
    pub fn get_subtree(&self, prefix: &str) -> BTreeMap<String, String> {
        let props = self.props.lock().unwrap();
        let now = Utc::now();
        props
            .range(prefix.to_string()..)
            .take_while(|(path, _)| path.starts_with(prefix))
            .filter(|(_, prop)| prop.expires.map(|expiry| expiry > now).unwrap_or(true))
            .map(|(path, prop)| (path.clone(), prop.value.clone()))
            .collect()
    }

    /// Create or replace a property and notify watchers.
    pub fn set(&self, path: &str, value: &str, expires: Option<DateTime<Utc>>) {
        {
            let mut props = self.props.lock().unwrap();
            props.insert(
                path.to_string(),
                PropValue {
                    value: value.to_string(),
                    expires,
                },
            );
        }
        self.notify(path, EventKind::Change, Some(value.to_string()));
    }

    /// Remove a property. Removing an absent path is not an error and
    /// produces no event.
    pub fn delete(&self, path: &str) {
        let removed = {
            let mut props = self.props.lock().unwrap();
            props.remove(path).is_some()
        };
        if removed {
            self.notify(path, EventKind::Delete, None);
        }
    }

    /// Sweep expired properties, emitting an `Expire` event for each.
    /// Returns the number of properties removed.
    pub fn expire_stale(&self) -> usize {
        let now = Utc::now();
        let stale: Vec<String> = {
            let props = self.props.lock().unwrap();
            props
                .iter()
                .filter(|(_, prop)| prop.expires.map(|expiry| expiry <= now).unwrap_or(false))
                .map(|(path, _)| path.clone())
                .collect()
        };
        for path in &stale {
            self.props.lock().unwrap().remove(path);
            log::debug!("expired {}", path);
            self.notify(path, EventKind::Expire, None);
        }
        stale.len()
    }

    fn notify(&self, path: &str, kind: EventKind, value: Option<String>) {
        // send() only fails when no watcher is subscribed, which is a
        // legal state during startup.
        let _ = self.watchers.send(PropEvent {
            path: path.to_string(),
            kind,
            value,
        });
    }
}

impl Default for ConfigTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn set_then_get_round_trip() {
        let tree = ConfigTree::new();
        tree.set("@/siteid", "example", None);
        assert_eq!(tree.get("@/siteid"), Some("example".to_string()));
        assert_eq!(tree.get("@/missing"), None);
    }

    #[test]
    fn expired_property_reads_as_absent() {
        let tree = ConfigTree::new();
        let past = Utc::now() - Duration::seconds(5);
        tree.set("@/clients/aa:bb:cc:dd:ee:ff/ipv4", "192.168.10.5", Some(past));
        assert_eq!(tree.get("@/clients/aa:bb:cc:dd:ee:ff/ipv4"), None);
        assert_eq!(tree.expire_stale(), 1);
        assert_eq!(tree.expire_stale(), 0);
    }

    #[test]
    fn subtree_scopes_to_prefix() {
        let tree = ConfigTree::new();
        tree.set("@/dns/cnames/www", "laptop", None);
        tree.set("@/dns/cnames/files", "nas", None);
        tree.set("@/dnsmasq/unrelated", "x", None);

        let subtree = tree.get_subtree("@/dns/cnames/");
        assert_eq!(subtree.len(), 2);
        assert_eq!(subtree.get("@/dns/cnames/www"), Some(&"laptop".to_string()));
    }

    #[tokio::test]
    async fn watcher_sees_change_delete_expire() {
        let tree = ConfigTree::new();
        let mut events = tree.watch();

        tree.set("@/network/dns/server", "8.8.8.8", None);
        tree.delete("@/network/dns/server");
        tree.set(
            "@/clients/aa:bb:cc:dd:ee:ff/dhcp_name",
            "printer",
            Some(Utc::now() - Duration::seconds(1)),
        );
        tree.expire_stale();

        let change = events.recv().await.unwrap();
        assert_eq!(change.kind, EventKind::Change);
        assert_eq!(change.value.as_deref(), Some("8.8.8.8"));

        let delete = events.recv().await.unwrap();
        assert_eq!(delete.kind, EventKind::Delete);
        assert_eq!(delete.path, "@/network/dns/server");

        // The Change for the dhcp_name set precedes its Expire.
        let lease = events.recv().await.unwrap();
        assert_eq!(lease.kind, EventKind::Change);
        let expire = events.recv().await.unwrap();
        assert_eq!(expire.kind, EventKind::Expire);
        assert_eq!(expire.path, "@/clients/aa:bb:cc:dd:ee:ff/dhcp_name");
    }

    #[test]
    fn deleting_absent_path_is_silent() {
        let tree = ConfigTree::new();
        let mut events = tree.watch();
        tree.delete("@/nothing/here");
        assert!(events.try_recv().is_err());
    }
}
