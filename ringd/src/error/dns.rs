//! DNS responder errors and their mapping onto RFC 1035 response
//! codes.
//!
//! The mapping policy: malformed queries are client errors and map to
//! `FormErr`; upstream and internal failures map to `ServFail`; an
//! unknown requestor maps to no response at all (the handler drops the
//! query silently).

use hickory_proto::op::{MessageType, OpCode};

pub type Result<T> = std::result::Result<T, DnsError>;

#[derive(Debug)]
pub enum DnsError {
    /// The query's OpCode was not a standard `Query`.
    InvalidOpCode(OpCode),
    /// The message was not a query at all.
    InvalidMessageType(MessageType),
    /// Not exactly one question (maps to `FormErr`).
    BadQuestionCount(usize),
    /// No upstream DNS server is configured.
    NoUpstream,
    /// The upstream exchange failed.
    Upstream(String),
    /// The upstream exchange timed out.
    UpstreamTimeout,
    /// DNS wire-format encode/decode failure.
    Proto(String),
    /// Socket-level failure while serving the query.
    Io(std::io::Error),
}

impl std::fmt::Display for DnsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DnsError::InvalidOpCode(opcode) => write!(f, "Invalid DNS OpCode: {:?}", opcode),
            DnsError::InvalidMessageType(msg_type) => {
                write!(f, "Invalid DNS MessageType: {:?}", msg_type)
            }
            DnsError::BadQuestionCount(count) => {
                write!(f, "Expected exactly one question, got {}", count)
            }
            DnsError::NoUpstream => write!(f, "No upstream DNS server configured"),
            DnsError::Upstream(msg) => write!(f, "Upstream Error: {}", msg),
            DnsError::UpstreamTimeout => write!(f, "Upstream Error: exchange timed out"),
            DnsError::Proto(msg) => write!(f, "Wire Format Error: {}", msg),
            DnsError::Io(err) => write!(f, "I/O Error: {}", err),
        }
    }
}

impl From<std::io::Error> for DnsError {
    fn from(err: std::io::Error) -> Self {
        DnsError::Io(err)
    }
}

impl From<hickory_proto::ProtoError> for DnsError {
    fn from(err: hickory_proto::ProtoError) -> Self {
        DnsError::Proto(err.to_string())
    }
}

impl From<reqwest::Error> for DnsError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DnsError::UpstreamTimeout
        } else {
            DnsError::Upstream(err.to_string())
        }
    }
}
