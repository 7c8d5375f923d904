//! Edge network services core for the appliance: the recursive DNS
//! responder and the multicast service relay, plus the ring/client
//! plumbing they share.
//!
//! Everything here runs inside one process. The DNS responder owns
//! UDP:53/TCP:53 and mediates name resolution per ring-visibility
//! policy; the relay bridges mDNS and SSDP between rings under an
//! ordered trust policy. Both consume the configuration tree exposed
//! by the `cfgtree` crate and publish structured observation events.

/// Client table: MAC/IP/ring bindings and naming state.
pub mod clients;
/// The DNS responder and its cache, host map, and upstream plumbing.
pub mod dns;
/// Per-layer error types.
pub mod error;
/// Event broker contract and payloads.
pub mod events;
/// The mDNS/SSDP multicast relay.
pub mod relay;
/// Ring topology and visibility policy.
pub mod rings;
/// Metric names.
pub mod stats;
