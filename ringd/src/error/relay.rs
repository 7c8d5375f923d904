//! Multicast relay errors. Per-packet failures are logged and the
//! worker moves on; only socket setup failures abort a worker.

use std::net::IpAddr;

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Debug)]
pub enum RelayError {
    /// Socket create/bind/join failure.
    Io(std::io::Error),
    /// The packet could not be parsed as the service's protocol.
    BadPacket(String),
    /// The packet's source maps to no configured ring.
    UnknownOrigin(IpAddr),
    /// Every SSDP reply port is in flight.
    PoolExhausted,
}

impl RelayError {
    pub fn bad_packet(msg: &str) -> Self {
        RelayError::BadPacket(msg.to_string())
    }
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::Io(err) => write!(f, "I/O Error: {}", err),
            RelayError::BadPacket(msg) => write!(f, "Bad Packet: {}", msg),
            RelayError::UnknownOrigin(addr) => write!(f, "Unknown Origin: {}", addr),
            RelayError::PoolExhausted => write!(f, "too many outstanding M-SEARCH requests"),
        }
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Io(err)
    }
}
