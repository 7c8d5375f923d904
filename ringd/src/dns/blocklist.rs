//! Known-malicious hostname list.
//!
//! The list itself is produced out of process and delivered as a file
//! of one hostname per line; `@/updates/dns_*list` change events tell
//! us when to reload it. Lookups are exact-match on the lowercased
//! hostname without its trailing dot.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

pub struct Blocklist {
    path: Option<PathBuf>,
    hosts: RwLock<HashSet<String>>,
}

impl Blocklist {
    /// An empty list that blocks nothing; used when no list file is
    /// configured.
    pub fn empty() -> Self {
        Blocklist {
            path: None,
            hosts: RwLock::new(HashSet::new()),
        }
    }

    pub fn from_file(path: &Path) -> Self {
        let list = Blocklist {
            path: Some(path.to_path_buf()),
            hosts: RwLock::new(HashSet::new()),
        };
        list.reload();
        list
    }

    /// Re-read the backing file. A missing or unreadable file leaves
    /// the previous contents in place.
    pub fn reload(&self) {
        let path = match &self.path {
            Some(path) => path,
            None => return,
        };
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) => {
                log::warn!("blocklist {} unreadable: {}", path.display(), err);
                return;
            }
        };
        let fresh: HashSet<String> = contents
            .lines()
            .map(|line| line.trim())
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(normalize)
            .collect();
        log::info!("blocklist {}: {} hostnames", path.display(), fresh.len());
        *self.hosts.write().unwrap() = fresh;
    }

    pub fn blocked(&self, hostname: &str) -> bool {
        self.hosts.read().unwrap().contains(&normalize(hostname))
    }

    pub fn len(&self) -> usize {
        self.hosts.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub fn from_hosts(hosts: &[&str]) -> Self {
        Blocklist {
            path: None,
            hosts: RwLock::new(hosts.iter().map(|h| normalize(h)).collect()),
        }
    }

    #[cfg(test)]
    pub fn insert(&self, hostname: &str) {
        self.hosts.write().unwrap().insert(normalize(hostname));
    }
}

fn normalize<S: AsRef<str>>(hostname: S) -> String {
    hostname
        .as_ref()
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_ignores_case_and_trailing_dot() {
        let list = Blocklist::from_hosts(&["evil.example.com"]);
        assert!(list.blocked("evil.example.com"));
        assert!(list.blocked("EVIL.example.COM."));
        assert!(!list.blocked("good.example.com"));
    }

    #[test]
    fn empty_list_blocks_nothing() {
        let list = Blocklist::empty();
        assert!(!list.blocked("evil.example.com"));
        list.reload();
        assert!(list.is_empty());
    }
}
