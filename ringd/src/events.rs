//! Structured observation events published to the external broker.
//!
//! The broker itself is out of process; [`EventSink`] is the contract
//! the core publishes through. Payloads are serde-serializable structs
//! so the wire encoding is the sink's choice. The default [`LogSink`]
//! writes events through `log` for standalone operation and tests.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub const TOPIC_LISTEN: &str = "listen";
pub const TOPIC_REQUEST: &str = "request";
pub const TOPIC_ENTITY: &str = "entity";
pub const TOPIC_EXCEPTION: &str = "exception";

pub trait EventSink: Send + Sync {
    fn publish(&self, topic: &str, payload: serde_json::Value);
}

/// Serialize and publish in one step; serialization failures are
/// logged, never propagated into a handler.
pub fn publish<T: Serialize>(sink: &dyn EventSink, topic: &str, event: &T) {
    match serde_json::to_value(event) {
        Ok(payload) => sink.publish(topic, payload),
        Err(err) => log::error!("dropping {} event: {}", topic, err),
    }
}

/// Sink of last resort: structured lines through the process log.
pub struct LogSink;

impl EventSink for LogSink {
    fn publish(&self, topic: &str, payload: serde_json::Value) {
        log::debug!("event [{}] {}", topic, payload);
    }
}

/// A DNS transaction observed by the responder (`TOPIC_REQUEST`).
#[derive(Debug, Serialize)]
pub struct DnsRequestEvent {
    pub requestor: String,
    pub protocol: &'static str,
    pub questions: Vec<String>,
    pub answers: Vec<String>,
    pub handler: &'static str,
    pub timestamp: DateTime<Utc>,
}

/// mDNS traffic seen by the relay (`TOPIC_LISTEN`).
#[derive(Debug, Serialize)]
pub struct MdnsListenEvent {
    pub requestor: String,
    pub requests: Vec<String>,
    pub responses: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SsdpMessageType {
    #[serde(rename = "DISCOVER")]
    Discover,
    #[serde(rename = "ALIVE")]
    Alive,
    #[serde(rename = "BYEBYE")]
    Byebye,
}

/// SSDP traffic seen by the relay (`TOPIC_LISTEN`).
#[derive(Debug, Serialize)]
pub struct SsdpListenEvent {
    #[serde(rename = "type")]
    pub message_type: SsdpMessageType,
    pub requestor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique_service_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification_type: Option<String>,
    pub extra_headers: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

/// A sighting of a source the client table knows nothing about
/// (`TOPIC_ENTITY`).
#[derive(Debug, Serialize)]
pub struct EntityEvent {
    pub ipv4: String,
    pub observed_by: &'static str,
    pub timestamp: DateTime<Utc>,
}

/// A policy exception, currently only phishing blocks
/// (`TOPIC_EXCEPTION`).
#[derive(Debug, Serialize)]
pub struct ExceptionEvent {
    pub reason: &'static str,
    pub protocol: &'static str,
    pub hostname: String,
    pub mac: String,
    pub ipv4: String,
    pub timestamp: DateTime<Utc>,
}

pub const REASON_PHISHING: &str = "PHISHING_ADDRESS";

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::sync::Mutex;

    /// Sink that records everything published, for assertions.
    pub struct CaptureSink {
        pub events: Mutex<Vec<(String, serde_json::Value)>>,
    }

    impl CaptureSink {
        pub fn new() -> Self {
            CaptureSink {
                events: Mutex::new(Vec::new()),
            }
        }

        pub fn count(&self, topic: &str) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|(t, _)| t == topic)
                .count()
        }
    }

    impl EventSink for CaptureSink {
        fn publish(&self, topic: &str, payload: serde_json::Value) {
            self.events
                .lock()
                .unwrap()
                .push((topic.to_string(), payload));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testutil::CaptureSink;

    #[test]
    fn exception_event_serializes_with_reason() {
        let sink = CaptureSink::new();
        publish(
            &sink,
            TOPIC_EXCEPTION,
            &ExceptionEvent {
                reason: REASON_PHISHING,
                protocol: "DNS",
                hostname: "evil.example.com.".to_string(),
                mac: "aa:bb:cc:dd:ee:ff".to_string(),
                ipv4: "192.168.20.44".to_string(),
                timestamp: Utc::now(),
            },
        );
        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1["reason"], "PHISHING_ADDRESS");
    }

    #[test]
    fn ssdp_type_uses_wire_names() {
        let value = serde_json::to_value(SsdpMessageType::Discover).unwrap();
        assert_eq!(value, "DISCOVER");
    }
}
