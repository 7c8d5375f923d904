//! SSDP passthrough and the M-SEARCH reply path.
//!
//! SSDP is HTTP over UDP: a start line, CRLF-separated headers, no
//! body worth speaking of. NOTIFY packets relay as-is. M-SEARCH needs
//! more care: responders reply unicast to the packet's source port, so
//! each relayed search is re-sourced from a pre-opened ephemeral reply
//! port and a task shuttles the replies back to the original
//! requestor.
//!
//! The MX header is the longest a responder may wait before replying,
//! and every outstanding search pins a reply port for twice that long.
//! Searches arriving with MX above the cap are rewritten down to it so
//! a slow spec-maximum search cannot pin a port for four minutes.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::net::UdpSocket;

use crate::error::app::AppError;
use crate::error::relay::{RelayError, Result};
use crate::events::{self, EventSink, SsdpListenEvent, SsdpMessageType};
use crate::relay::Endpoint;
use crate::stats;

/// Ceiling applied to the MX header of forwarded searches.
const MX_CAP: u32 = 5;

/// Receive buffer carried by each reply state.
const REPLY_BUF_SIZE: usize = 4096;

/// Headers lifted into dedicated event fields rather than the
/// extra-header map.
const EVENT_HEADERS: &[&str] = &[
    "host",
    "man",
    "mx",
    "st",
    "nt",
    "nts",
    "server",
    "usn",
    "location",
];

/// A parsed HTTP-over-UDP packet. Header order is preserved so a
/// rewritten packet re-serializes recognizably.
pub(crate) struct SsdpPacket {
    start_line: String,
    headers: Vec<(String, String)>,
}

impl SsdpPacket {
    pub(crate) fn parse(data: &[u8]) -> Result<SsdpPacket> {
        let text = std::str::from_utf8(data)
            .map_err(|err| RelayError::BadPacket(format!("not utf-8: {}", err)))?;
        let mut lines = text.split("\r\n");
        let start_line = match lines.next() {
            Some(line) if !line.trim().is_empty() => line.trim().to_string(),
            _ => return Err(RelayError::bad_packet("empty start line")),
        };
        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| RelayError::BadPacket(format!("bad header line {:?}", line)))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
        Ok(SsdpPacket {
            start_line,
            headers,
        })
    }

    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub(crate) fn set_header(&mut self, name: &str, value: &str) {
        for (header, stored) in &mut self.headers {
            if header.eq_ignore_ascii_case(name) {
                *stored = value.to_string();
                return;
            }
        }
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub(crate) fn method(&self) -> Option<&str> {
        if self.is_response() {
            return None;
        }
        self.start_line.split_whitespace().next()
    }

    pub(crate) fn is_response(&self) -> bool {
        self.start_line.starts_with("HTTP/")
    }

    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::with_capacity(256);
        out.push_str(&self.start_line);
        out.push_str("\r\n");
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

/// One pre-opened unicast reply port with its receive buffer.
pub struct ReplyState {
    pub(crate) socket: Arc<UdpSocket>,
    pub(crate) buf: Vec<u8>,
    port: u16,
}

impl ReplyState {
    pub fn port(&self) -> u16 {
        self.port
    }
}

/// The fixed pool of reply ports. Free states form a stack; allocation
/// never opens new ports.
pub struct SsdpPool {
    free: Mutex<Vec<ReplyState>>,
    size: usize,
}

impl SsdpPool {
    /// Open `count` contiguous ports starting at `base`. A base of 0
    /// takes ephemeral ports instead (tests).
    pub async fn open(base: u16, count: usize) -> std::result::Result<SsdpPool, AppError> {
        let mut free = Vec::with_capacity(count);
        for offset in 0..count {
            let port = if base == 0 { 0 } else { base + offset as u16 };
            let socket =
                UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await?;
            let port = socket.local_addr()?.port();
            free.push(ReplyState {
                socket: Arc::new(socket),
                buf: vec![0u8; REPLY_BUF_SIZE],
                port,
            });
        }
        Ok(SsdpPool {
            free: Mutex::new(free),
            size: count,
        })
    }

    pub fn allocate(&self) -> Option<ReplyState> {
        self.free.lock().unwrap().pop()
    }

    pub fn release(&self, state: ReplyState) {
        self.free.lock().unwrap().push(state);
    }

    pub fn available(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// Ask the firewall to accept unicast replies on the pool's port range
/// on internal interfaces. The rule engine consumes these properties.
pub(crate) fn install_firewall_rule(tree: &cfgtree::ConfigTree, base: u16, count: usize) {
    if base == 0 || count == 0 {
        return;
    }
    let rule = format!("ACCEPT UDP :{}-{} not wan", base, base + count as u16 - 1);
    tree.set("@/firewall/rules/ssdp/rule", &rule, None);
    tree.set("@/firewall/rules/ssdp/active", "true", None);
}

/// Inspect one ingress SSDP packet; returns the bytes to forward.
pub(crate) async fn handle(
    pool: &Arc<SsdpPool>,
    sink: &dyn EventSink,
    endpoint: &mut Endpoint,
    data: &[u8],
) -> Result<Vec<u8>> {
    let packet = SsdpPacket::parse(data)?;
    if packet.is_response() {
        metrics::counter!(stats::RELAY_SSDP_RESPONSES).increment(1);
        return Ok(data.to_vec());
    }
    match packet.method() {
        Some("M-SEARCH") => handle_search(pool, sink, endpoint, packet, data).await,
        Some("NOTIFY") => handle_notify(sink, endpoint, &packet, data),
        Some(method) => Err(RelayError::BadPacket(format!(
            "unsupported ssdp method {}",
            method
        ))),
        None => Err(RelayError::bad_packet("no ssdp method")),
    }
}

async fn handle_search(
    pool: &Arc<SsdpPool>,
    sink: &dyn EventSink,
    endpoint: &mut Endpoint,
    mut packet: SsdpPacket,
    raw: &[u8],
) -> Result<Vec<u8>> {
    let man = packet.header("Man").unwrap_or_default();
    if man != "\"ssdp:discover\"" {
        return Err(RelayError::BadPacket(format!(
            "M-SEARCH without discover: {:?}",
            man
        )));
    }
    let mx: u32 = packet
        .header("MX")
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| RelayError::bad_packet("M-SEARCH without usable MX"))?;
    if !(1..=120).contains(&mx) {
        return Err(RelayError::BadPacket(format!("MX {} out of range", mx)));
    }

    metrics::counter!(stats::RELAY_SSDP_SEARCHES).increment(1);
    publish_event(sink, endpoint, SsdpMessageType::Discover, &packet);

    let forwarded = if mx > MX_CAP {
        packet.set_header("MX", &MX_CAP.to_string());
        if packet.header("Content-Length").is_none() {
            packet.set_header("Content-Length", "0");
        }
        packet.to_bytes()
    } else {
        raw.to_vec()
    };

    let state = pool.allocate().ok_or(RelayError::PoolExhausted)?;
    let window = Duration::from_secs(2 * u64::from(mx.min(MX_CAP)));
    let requestor_socket = Arc::clone(&endpoint.socket);
    let requestor_addr = endpoint.addr;
    // Forward the search from the ephemeral port so responders answer
    // there.
    endpoint.socket = Arc::clone(&state.socket);
    tokio::spawn(reply_relay(
        Arc::clone(pool),
        state,
        requestor_socket,
        requestor_addr,
        window,
    ));

    Ok(forwarded)
}

fn handle_notify(
    sink: &dyn EventSink,
    endpoint: &Endpoint,
    packet: &SsdpPacket,
    raw: &[u8],
) -> Result<Vec<u8>> {
    let kind = match packet.header("NTS") {
        Some("ssdp:alive") => SsdpMessageType::Alive,
        Some("ssdp:byebye") => SsdpMessageType::Byebye,
        other => {
            return Err(RelayError::BadPacket(format!(
                "NOTIFY with NTS {:?}",
                other.unwrap_or("<missing>")
            )))
        }
    };
    metrics::counter!(stats::RELAY_SSDP_NOTIFIES).increment(1);
    publish_event(sink, endpoint, kind, packet);
    Ok(raw.to_vec())
}

fn publish_event(
    sink: &dyn EventSink,
    endpoint: &Endpoint,
    message_type: SsdpMessageType,
    packet: &SsdpPacket,
) {
    let extra_headers: BTreeMap<String, String> = packet
        .headers
        .iter()
        .filter(|(name, _)| {
            !EVENT_HEADERS
                .iter()
                .any(|known| name.eq_ignore_ascii_case(known))
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    events::publish(
        sink,
        events::TOPIC_LISTEN,
        &SsdpListenEvent {
            message_type,
            requestor: endpoint.addr.ip().to_string(),
            server: packet.header("Server").map(str::to_string),
            unique_service_name: packet.header("USN").map(str::to_string),
            location: packet.header("Location").map(str::to_string),
            search_target: packet.header("ST").map(str::to_string),
            notification_type: packet.header("NT").map(str::to_string),
            extra_headers,
            timestamp: Utc::now(),
        },
    );
}

/// Shuttle M-SEARCH responses from the reply port back to the
/// original requestor until the window closes or anything goes wrong.
/// The reply state returns to the pool on every exit path.
pub(crate) async fn reply_relay(
    pool: Arc<SsdpPool>,
    mut state: ReplyState,
    requestor: Arc<UdpSocket>,
    requestor_addr: SocketAddr,
    window: Duration,
) {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let received = tokio::time::timeout_at(deadline, state.socket.recv_from(&mut state.buf)).await;
        match received {
            Err(_) => {
                metrics::counter!(stats::RELAY_SSDP_TIMEOUTS).increment(1);
                break;
            }
            Ok(Err(err)) => {
                log::debug!("ssdp reply port {}: {}", state.port, err);
                break;
            }
            Ok(Ok((len, from))) => {
                let bytes = &state.buf[..len];
                match SsdpPacket::parse(bytes) {
                    Ok(packet) if packet.is_response() => {}
                    _ => {
                        log::debug!("ssdp reply port {}: malformed response from {}", state.port, from);
                        break;
                    }
                }
                metrics::counter!(stats::RELAY_SSDP_RESPONSES).increment(1);
                match requestor.send_to(bytes, requestor_addr).await {
                    Ok(sent) if sent == len => {}
                    Ok(sent) => {
                        log::debug!(
                            "ssdp reply short write: {} of {} bytes to {}",
                            sent,
                            len,
                            requestor_addr
                        );
                        break;
                    }
                    Err(err) => {
                        log::debug!("ssdp reply to {} failed: {}", requestor_addr, err);
                        break;
                    }
                }
            }
        }
    }
    pool.release(state);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testutil::CaptureSink;

    const SEARCH_MX_30: &str = "M-SEARCH * HTTP/1.1\r\n\
        Host: 239.255.255.250:1900\r\n\
        Man: \"ssdp:discover\"\r\n\
        MX: 30\r\n\
        ST: upnp:rootdevice\r\n\r\n";

    async fn endpoint_at(addr: &str) -> Endpoint {
        Endpoint {
            addr: addr.parse().unwrap(),
            ring: "standard".to_string(),
            iface: "brvlan10".to_string(),
            socket: Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap()),
        }
    }

    #[test]
    fn parse_and_reserialize_round_trip() {
        let packet = SsdpPacket::parse(SEARCH_MX_30.as_bytes()).unwrap();
        assert_eq!(packet.method(), Some("M-SEARCH"));
        assert_eq!(packet.header("mx"), Some("30"));
        assert_eq!(packet.header("St"), Some("upnp:rootdevice"));
        assert!(!packet.is_response());

        let bytes = packet.to_bytes();
        let reparsed = SsdpPacket::parse(&bytes).unwrap();
        assert_eq!(reparsed.header("MX"), Some("30"));
    }

    #[tokio::test]
    async fn msearch_above_cap_is_rewritten_and_resourced() {
        let pool = Arc::new(SsdpPool::open(0, 2).await.unwrap());
        let sink = CaptureSink::new();
        let mut endpoint = endpoint_at("192.168.10.5:49152").await;
        let original_port = endpoint.socket.local_addr().unwrap().port();

        let forwarded = handle(&pool, &sink, &mut endpoint, SEARCH_MX_30.as_bytes())
            .await
            .unwrap();

        let packet = SsdpPacket::parse(&forwarded).unwrap();
        assert_eq!(packet.header("MX"), Some("5"));
        assert_eq!(packet.header("Content-Length"), Some("0"));

        // The forwarding endpoint now points at a pool port.
        let reply_port = endpoint.socket.local_addr().unwrap().port();
        assert_ne!(reply_port, original_port);
        assert_eq!(pool.available(), 1);

        assert_eq!(sink.count(events::TOPIC_LISTEN), 1);
        let captured = sink.events.lock().unwrap();
        assert_eq!(captured[0].1["type"], "DISCOVER");
    }

    #[tokio::test]
    async fn msearch_within_cap_passes_unmodified() {
        let pool = Arc::new(SsdpPool::open(0, 1).await.unwrap());
        let sink = CaptureSink::new();
        let mut endpoint = endpoint_at("192.168.10.5:49152").await;

        let raw = SEARCH_MX_30.replace("MX: 30", "MX: 3");
        let forwarded = handle(&pool, &sink, &mut endpoint, raw.as_bytes())
            .await
            .unwrap();
        assert_eq!(forwarded, raw.as_bytes());
    }

    #[tokio::test]
    async fn msearch_without_discover_or_mx_is_rejected() {
        let pool = Arc::new(SsdpPool::open(0, 1).await.unwrap());
        let sink = CaptureSink::new();
        let mut endpoint = endpoint_at("192.168.10.5:49152").await;

        let no_man = SEARCH_MX_30.replace("Man: \"ssdp:discover\"", "Man: \"ssdp:other\"");
        assert!(handle(&pool, &sink, &mut endpoint, no_man.as_bytes())
            .await
            .is_err());

        let bad_mx = SEARCH_MX_30.replace("MX: 30", "MX: 500");
        assert!(handle(&pool, &sink, &mut endpoint, bad_mx.as_bytes())
            .await
            .is_err());
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn pool_exhaustion_rejects_the_search() {
        let pool = Arc::new(SsdpPool::open(0, 1).await.unwrap());
        let sink = CaptureSink::new();

        let mut first = endpoint_at("192.168.10.5:49152").await;
        handle(&pool, &sink, &mut first, SEARCH_MX_30.as_bytes())
            .await
            .unwrap();
        assert_eq!(pool.available(), 0);

        let mut second = endpoint_at("192.168.10.6:49153").await;
        let rejected = handle(&pool, &sink, &mut second, SEARCH_MX_30.as_bytes()).await;
        assert!(matches!(rejected, Err(RelayError::PoolExhausted)));
    }

    #[tokio::test]
    async fn notify_variants_are_classified() {
        let pool = Arc::new(SsdpPool::open(0, 1).await.unwrap());
        let sink = CaptureSink::new();
        let mut endpoint = endpoint_at("192.168.20.44:1900").await;

        let alive = "NOTIFY * HTTP/1.1\r\n\
            Host: 239.255.255.250:1900\r\n\
            NT: upnp:rootdevice\r\n\
            NTS: ssdp:alive\r\n\
            USN: uuid:fridge-1\r\n\
            Server: Linux/5.4 UPnP/1.0\r\n\
            Location: http://192.168.20.44:8080/desc.xml\r\n\r\n";
        handle(&pool, &sink, &mut endpoint, alive.as_bytes())
            .await
            .unwrap();

        let byebye = alive.replace("ssdp:alive", "ssdp:byebye");
        handle(&pool, &sink, &mut endpoint, byebye.as_bytes())
            .await
            .unwrap();

        let captured = sink.events.lock().unwrap();
        assert_eq!(captured.len(), 2);
        assert_eq!(captured[0].1["type"], "ALIVE");
        assert_eq!(captured[0].1["unique_service_name"], "uuid:fridge-1");
        assert_eq!(captured[1].1["type"], "BYEBYE");

        let bad = alive.replace("ssdp:alive", "ssdp:unknown");
        assert!(handle(&pool, &sink, &mut endpoint, bad.as_bytes())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn reply_relay_forwards_and_returns_state_on_timeout() {
        let pool = Arc::new(SsdpPool::open(0, 1).await.unwrap());
        let state = pool.allocate().unwrap();
        let reply_port = state.port();

        let requestor = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let requestor_addr = requestor.local_addr().unwrap();

        let task = tokio::spawn(reply_relay(
            Arc::clone(&pool),
            state,
            Arc::clone(&requestor),
            requestor_addr,
            Duration::from_millis(300),
        ));

        // A device answers the forwarded search on the reply port.
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let response = "HTTP/1.1 200 OK\r\n\
            ST: upnp:rootdevice\r\n\
            USN: uuid:fridge-1\r\n\r\n";
        device
            .send_to(response.as_bytes(), ("127.0.0.1", reply_port))
            .await
            .unwrap();

        let mut buf = [0u8; 1024];
        let (len, _) = requestor.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], response.as_bytes());

        // Window closes, state comes home.
        task.await.unwrap();
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn reply_relay_terminates_on_malformed_response() {
        let pool = Arc::new(SsdpPool::open(0, 1).await.unwrap());
        let state = pool.allocate().unwrap();
        let reply_port = state.port();

        let requestor = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let requestor_addr = requestor.local_addr().unwrap();

        let task = tokio::spawn(reply_relay(
            Arc::clone(&pool),
            state,
            requestor,
            requestor_addr,
            Duration::from_secs(5),
        ));

        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        device
            .send_to(b"not an http response", ("127.0.0.1", reply_port))
            .await
            .unwrap();

        task.await.unwrap();
        assert_eq!(pool.available(), 1);
    }
}
