//! Metric names emitted through the `metrics` facade. The exporter is
//! wired up by the embedding process; nothing here depends on one.

pub const DNS_REQUESTS: &str = "dns_requests";
pub const DNS_BLOCKED: &str = "dns_blocked";
pub const DNS_UPSTREAM_COUNT: &str = "dns_upstream_count";
pub const DNS_UPSTREAM_FAILURES: &str = "dns_upstream_failures";
pub const DNS_UPSTREAM_TIMEOUTS: &str = "dns_upstream_timeouts";

pub const DNS_UPSTREAM_LATENCY: &str = "dns_upstream_latency_seconds";
pub const DNS_REQUEST_SIZE: &str = "dns_request_size_bytes";
pub const DNS_RESPONSE_SIZE: &str = "dns_response_size_bytes";

pub const CACHE_LOOKUPS: &str = "dns_cache_lookups";
pub const CACHE_COLLISIONS: &str = "dns_cache_collisions";
pub const CACHE_SIZE: &str = "dns_cache_size_bytes";
pub const CACHE_ENTRIES: &str = "dns_cache_entries";
pub const CACHE_HIT_RATE: &str = "dns_cache_hit_rate";

pub const RELAY_MDNS_REQUESTS: &str = "relay_mdns_requests";
pub const RELAY_MDNS_REPLIES: &str = "relay_mdns_replies";
pub const RELAY_SSDP_SEARCHES: &str = "relay_ssdp_searches";
pub const RELAY_SSDP_TIMEOUTS: &str = "relay_ssdp_timeouts";
pub const RELAY_SSDP_NOTIFIES: &str = "relay_ssdp_notifies";
pub const RELAY_SSDP_RESPONSES: &str = "relay_ssdp_responses";
