//! Rate limiting for noisy conditions.
//!
//! Two hourly ledgers: unknown source addresses, and blocked
//! hostnames per client MAC. A key is "warned" if it was reported
//! within the window; a throttled check both tests and records.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const WARN_WINDOW: Duration = Duration::from_secs(3600);

/// One-entry throttle for the upstream-failure log line.
pub struct ThrottledLog {
    every: Duration,
    last: Mutex<Option<Instant>>,
}

impl ThrottledLog {
    pub fn new(every: Duration) -> Self {
        ThrottledLog {
            every,
            last: Mutex::new(None),
        }
    }

    /// True at most once per window; a true result counts as a report.
    pub fn ready(&self) -> bool {
        let mut last = self.last.lock().unwrap();
        let now = Instant::now();
        match *last {
            Some(when) if now.duration_since(when) < self.every => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

pub struct WarningLog {
    unknown_sources: Mutex<HashMap<String, Instant>>,
    blocked_pairs: Mutex<HashMap<String, Instant>>,
}

impl WarningLog {
    pub fn new() -> Self {
        WarningLog {
            unknown_sources: Mutex::new(HashMap::new()),
            blocked_pairs: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a query from unknown `source` should be reported now.
    pub fn should_warn_source(&self, source: &str) -> bool {
        should_warn(&self.unknown_sources, source)
    }

    /// Whether this (mac, hostname) block should be reported now.
    pub fn should_warn_blocked(&self, mac: &str, hostname: &str) -> bool {
        should_warn(&self.blocked_pairs, &format!("{}|{}", mac, hostname))
    }
}

impl Default for WarningLog {
    fn default() -> Self {
        Self::new()
    }
}

fn should_warn(ledger: &Mutex<HashMap<String, Instant>>, key: &str) -> bool {
    let mut ledger = ledger.lock().unwrap();
    let now = Instant::now();
    // Keep the ledger from growing without bound under scanning.
    if ledger.len() > 4096 {
        ledger.retain(|_, when| now.duration_since(*when) < WARN_WINDOW);
    }
    match ledger.get(key) {
        Some(when) if now.duration_since(*when) < WARN_WINDOW => false,
        _ => {
            ledger.insert(key.to_string(), now);
            true
        }
    }
}
