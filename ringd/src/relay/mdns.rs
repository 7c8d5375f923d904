//! mDNS passthrough.
//!
//! Packets are parsed only to be observed: requests and replies are
//! counted and published as listen events, then the original bytes are
//! forwarded untouched. The relay never forges or rewrites mDNS.

use chrono::Utc;
use hickory_proto::op::Message;

use crate::error::relay::{RelayError, Result};
use crate::events::{self, EventSink, MdnsListenEvent};
use crate::relay::Endpoint;
use crate::stats;

pub(crate) fn handle(
    sink: &dyn EventSink,
    endpoint: &Endpoint,
    packet: &[u8],
) -> Result<Vec<u8>> {
    let message = Message::from_vec(packet)
        .map_err(|err| RelayError::BadPacket(format!("mdns parse: {}", err)))?;

    let requests: Vec<String> = message
        .queries()
        .iter()
        .map(|query| {
            format!(
                "{} {} {}",
                query.name(),
                query.query_class(),
                query.query_type()
            )
        })
        .collect();
    let responses: Vec<String> = message
        .answers()
        .iter()
        .map(|record| record.to_string())
        .collect();

    if !requests.is_empty() {
        metrics::counter!(stats::RELAY_MDNS_REQUESTS).increment(1);
    }
    if !responses.is_empty() {
        metrics::counter!(stats::RELAY_MDNS_REPLIES).increment(1);
    }
    events::publish(
        sink,
        events::TOPIC_LISTEN,
        &MdnsListenEvent {
            requestor: endpoint.addr.ip().to_string(),
            requests,
            responses,
            timestamp: Utc::now(),
        },
    );

    Ok(packet.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testutil::CaptureSink;
    use hickory_proto::op::Query;
    use hickory_proto::rr::{Name, RecordType};
    use std::net::SocketAddr;
    use std::str::FromStr;
    use std::sync::Arc;
    use tokio::net::UdpSocket;

    async fn endpoint_at(addr: &str) -> Endpoint {
        Endpoint {
            addr: addr.parse::<SocketAddr>().unwrap(),
            ring: "standard".to_string(),
            iface: "brvlan10".to_string(),
            socket: Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap()),
        }
    }

    #[tokio::test]
    async fn query_packets_are_observed_and_passed_through() {
        let sink = CaptureSink::new();
        let endpoint = endpoint_at("192.168.10.5:5353").await;

        let mut message = Message::new();
        message.add_query(Query::query(
            Name::from_str("_airplay._tcp.local.").unwrap(),
            RecordType::PTR,
        ));
        let bytes = message.to_vec().unwrap();

        let forwarded = handle(&sink, &endpoint, &bytes).unwrap();
        assert_eq!(forwarded, bytes);

        let captured = sink.events.lock().unwrap();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].0, events::TOPIC_LISTEN);
        assert_eq!(captured[0].1["requestor"], "192.168.10.5");
        assert_eq!(captured[0].1["requests"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn garbage_is_rejected() {
        let sink = CaptureSink::new();
        let endpoint = endpoint_at("192.168.10.5:5353").await;
        assert!(handle(&sink, &endpoint, &[0x01, 0x02]).is_err());
    }
}
