//! Forwarding queries to the configured upstream.
//!
//! Two transports: plain DNS over UDP (the common case) and
//! DNS-over-HTTPS for `https://` upstream specs. Both move whole wire
//! messages; the responder decides what to forward and what to do
//! with the answer.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use hickory_proto::op::Message;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tokio::net::UdpSocket;

use crate::error::app::AppError;
use crate::error::dns::{DnsError, Result};
use crate::stats;

/// Media type of DNS wire messages tunneled over HTTP POST.
const DOH_CONTENT_TYPE: &str = "application/dns-udpwireformat";

/// Read timeout on the plain-UDP exchange.
const PLAIN_DNS_TIMEOUT: Duration = Duration::from_secs(2);

const DOH_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DOH_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Where external queries go.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Upstream {
    /// DNS-over-HTTPS endpoint URL.
    Doh(String),
    /// Plain DNS server address.
    Plain(SocketAddr),
}

impl Upstream {
    /// Parse an upstream spec: an `https://` URL selects DoH,
    /// anything else must be `ip[:port]` with port 53 defaulted.
    pub fn parse(spec: &str) -> std::result::Result<Upstream, AppError> {
        let spec = spec.trim();
        if spec.starts_with("https://") {
            return Ok(Upstream::Doh(spec.to_string()));
        }
        if let Ok(addr) = spec.parse::<SocketAddr>() {
            return Ok(Upstream::Plain(addr));
        }
        let addr: IpAddr = spec.parse()?;
        Ok(Upstream::Plain(SocketAddr::new(addr, 53)))
    }
}

impl std::fmt::Display for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Upstream::Doh(url) => write!(f, "{}", url),
            Upstream::Plain(addr) => write!(f, "{}", addr),
        }
    }
}

/// Shared upstream exchange machinery: one HTTP client for DoH and
/// the latency/failure accounting both transports share.
pub struct Forwarder {
    http: reqwest::Client,
}

impl Forwarder {
    pub fn new() -> std::result::Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .connect_timeout(DOH_CONNECT_TIMEOUT)
            .timeout(DOH_REQUEST_TIMEOUT)
            .build()
            .map_err(|err| AppError::Config(format!("doh client: {}", err)))?;
        Ok(Forwarder { http })
    }

    /// Exchange `query` with `upstream`, updating the upstream
    /// counters and summaries either way.
    pub async fn exchange(&self, upstream: &Upstream, query: &Message) -> Result<Message> {
        metrics::counter!(stats::DNS_UPSTREAM_COUNT).increment(1);
        let encoded = query.to_vec()?;
        metrics::histogram!(stats::DNS_REQUEST_SIZE).record(encoded.len() as f64);

        let start = Instant::now();
        let result = match upstream {
            Upstream::Doh(url) => self.doh_exchange(url, encoded).await,
            Upstream::Plain(addr) => plain_exchange(*addr, &encoded, query.id()).await,
        };

        match &result {
            Ok(response) => {
                metrics::histogram!(stats::DNS_UPSTREAM_LATENCY)
                    .record(start.elapsed().as_secs_f64());
                if let Ok(bytes) = response.to_vec() {
                    metrics::histogram!(stats::DNS_RESPONSE_SIZE).record(bytes.len() as f64);
                }
            }
            Err(err) => {
                metrics::counter!(stats::DNS_UPSTREAM_FAILURES).increment(1);
                if matches!(err, DnsError::UpstreamTimeout) {
                    metrics::counter!(stats::DNS_UPSTREAM_TIMEOUTS).increment(1);
                }
            }
        }
        result
    }

    async fn doh_exchange(&self, url: &str, body: Vec<u8>) -> Result<Message> {
        let response = self
            .http
            .post(url)
            .header(CONTENT_TYPE, DOH_CONTENT_TYPE)
            .header(ACCEPT, "*/*")
            .body(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DnsError::Upstream(format!(
                "DoH server returned {}",
                response.status()
            )));
        }
        let bytes = response.bytes().await?;
        Ok(Message::from_vec(&bytes)?)
    }
}

async fn plain_exchange(server: SocketAddr, query: &[u8], query_id: u16) -> Result<Message> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.send_to(query, server).await?;

    let mut buf = [0u8; 4096];
    let receive = async {
        loop {
            let (len, from) = socket.recv_from(&mut buf).await?;
            if from != server {
                continue;
            }
            let message = Message::from_vec(&buf[..len])?;
            if message.id() == query_id {
                return Ok(message);
            }
        }
    };
    match tokio::time::timeout(PLAIN_DNS_TIMEOUT, receive).await {
        Ok(result) => result,
        Err(_) => Err(DnsError::UpstreamTimeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, OpCode, Query};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::str::FromStr;

    #[test]
    fn upstream_spec_parsing() {
        assert_eq!(
            Upstream::parse("https://dns.example/dns-query").unwrap(),
            Upstream::Doh("https://dns.example/dns-query".to_string())
        );
        assert_eq!(
            Upstream::parse("9.9.9.9").unwrap(),
            Upstream::Plain("9.9.9.9:53".parse().unwrap())
        );
        assert_eq!(
            Upstream::parse("9.9.9.9:5353").unwrap(),
            Upstream::Plain("9.9.9.9:5353".parse().unwrap())
        );
        assert!(Upstream::parse("not-an-address").is_err());
    }

    #[tokio::test]
    async fn plain_exchange_round_trips_against_local_server() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            let query = Message::from_vec(&buf[..len]).unwrap();

            let mut reply = Message::new();
            reply
                .set_id(query.id())
                .set_message_type(MessageType::Response)
                .set_op_code(OpCode::Query);
            reply.add_query(query.queries()[0].clone());
            reply.add_answer(Record::from_rdata(
                Name::from_str("host.example.com.").unwrap(),
                120,
                RData::A(A::new(203, 0, 113, 7)),
            ));
            let bytes = reply.to_vec().unwrap();
            server.send_to(&bytes, from).await.unwrap();
        });

        let mut query = Message::new();
        query
            .set_id(4321)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true);
        query.add_query(Query::query(
            Name::from_str("host.example.com.").unwrap(),
            RecordType::A,
        ));

        let forwarder = Forwarder::new().unwrap();
        let response = forwarder
            .exchange(&Upstream::Plain(server_addr), &query)
            .await
            .unwrap();
        assert_eq!(response.id(), 4321);
        assert_eq!(response.answers().len(), 1);
    }

    #[tokio::test]
    async fn plain_exchange_times_out_without_a_server() {
        // An address that swallows packets: a bound socket we never
        // read from.
        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sink.local_addr().unwrap();

        let mut query = Message::new();
        query.set_id(7).set_op_code(OpCode::Query);
        query.add_query(Query::query(
            Name::from_str("host.example.com.").unwrap(),
            RecordType::A,
        ));

        let forwarder = Forwarder::new().unwrap();
        let result = forwarder.exchange(&Upstream::Plain(addr), &query).await;
        assert!(matches!(result, Err(DnsError::UpstreamTimeout)));
    }
}
