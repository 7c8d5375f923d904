/// Application-level errors: configuration, startup, naming.
pub mod app;
/// DNS responder errors and their response-code mapping.
pub mod dns;
/// Multicast relay errors.
pub mod relay;
