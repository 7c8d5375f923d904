//! Query handling: classification, requestor identity, and the
//! local/proxy answer paths.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use hickory_proto::op::{Header, LowerQuery, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, CNAME, PTR};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};

use crate::dns::cache;
use crate::dns::hosts::{self, DnsRecord, RecordKind};
use crate::dns::DnsResponder;
use crate::error::dns::{DnsError, Result};
use crate::events::{self, DnsRequestEvent, EntityEvent, ExceptionEvent};
use crate::rings;
use crate::stats;

const ZERO_MAC: &str = "00:00:00:00:00:00";

/// How a query is routed, decided purely from the lowercased question
/// name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum QueryClass {
    /// Carries the local-domain suffix.
    Local,
    /// A bare hostname: exactly one label.
    HostnameOnly,
    /// Reverse lookup for an address inside one of our subnets.
    Reverse(Ipv4Addr),
    External,
}

/// The resolved identity of a query's source address.
#[derive(Clone, Debug)]
pub(crate) struct Requestor {
    pub mac: String,
    pub ring: String,
    pub addr: IpAddr,
}

/// An assembled response, decoupled from the wire builder.
pub(crate) struct Reply {
    pub rcode: ResponseCode,
    pub authoritative: bool,
    pub recursion_available: bool,
    pub answers: Vec<Record>,
    pub name_servers: Vec<Record>,
    pub additionals: Vec<Record>,
    pub handler: &'static str,
}

impl Reply {
    fn local(answers: Vec<Record>) -> Reply {
        Reply {
            rcode: ResponseCode::NoError,
            authoritative: true,
            recursion_available: true,
            answers,
            name_servers: Vec::new(),
            additionals: Vec::new(),
            handler: "local",
        }
    }

    fn nodata() -> Reply {
        Reply::local(Vec::new())
    }

    fn from_upstream(message: &Message, handler: &'static str) -> Reply {
        Reply {
            rcode: message.response_code(),
            authoritative: false,
            recursion_available: true,
            answers: message.answers().to_vec(),
            name_servers: message.name_servers().to_vec(),
            // EDNS is negotiated per hop; never forward the OPT record.
            additionals: message
                .additionals()
                .iter()
                .filter(|record| record.record_type() != RecordType::OPT)
                .cloned()
                .collect(),
            handler,
        }
    }

    fn tagged(mut self, handler: &'static str) -> Reply {
        self.handler = handler;
        self
    }
}

impl DnsResponder {
    /// Classify a lowercased, dot-terminated question name.
    pub(crate) fn classify(&self, name: &str) -> QueryClass {
        if name == self.domain || name.ends_with(&format!(".{}", self.domain)) {
            return QueryClass::Local;
        }
        if name.matches('.').count() == 1 {
            return QueryClass::HostnameOnly;
        }
        if name.ends_with(".in-addr.arpa.") {
            if let Some(addr) = hosts::parse_reverse(name) {
                if self.rings.ring_for_ip(addr).is_some() {
                    return QueryClass::Reverse(addr);
                }
            }
        }
        QueryClass::External
    }

    /// Resolve a source address to a requestor: ourselves, an enrolled
    /// client, or a VPN client. `None` means the query gets no
    /// response.
    pub(crate) fn resolve_requestor(&self, src: IpAddr) -> Option<Requestor> {
        let ours = Requestor {
            mac: ZERO_MAC.to_string(),
            ring: rings::RING_CORE.to_string(),
            addr: src,
        };
        if src.is_loopback() {
            return Some(ours);
        }
        let v4 = match src {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(v6) => v6.to_ipv4_mapped()?,
        };
        if self.rings.is_local_address(v4) {
            return Some(ours);
        }
        if let Some(client) = self.clients.by_ip(v4) {
            return Some(Requestor {
                mac: client.mac,
                ring: client.ring,
                addr: src,
            });
        }
        if let Some(client) = self.clients.vpn_by_ip(v4) {
            return Some(Requestor {
                mac: client.mac,
                ring: client.ring,
                addr: src,
            });
        }
        None
    }

    /// Handle one request end to end. `Ok(None)` means the query is
    /// deliberately left unanswered.
    pub(crate) async fn handle(&self, request: &Request) -> Result<Option<Reply>> {
        metrics::counter!(stats::DNS_REQUESTS).increment(1);

        if request.op_code() != OpCode::Query {
            return Err(DnsError::InvalidOpCode(request.op_code()));
        }
        if request.message_type() != MessageType::Query {
            return Err(DnsError::InvalidMessageType(request.message_type()));
        }
        let queries = request.queries();
        if queries.len() != 1 {
            return Err(DnsError::BadQuestionCount(queries.len()));
        }
        let query = &queries[0];

        let src = request.src().ip();
        let requestor = match self.resolve_requestor(src) {
            Some(requestor) => requestor,
            None => {
                if self.warnings.should_warn_source(&src.to_string()) {
                    log::warn!("dns query from unknown source {}", src);
                    events::publish(
                        self.sink.as_ref(),
                        events::TOPIC_ENTITY,
                        &EntityEvent {
                            ipv4: src.to_string(),
                            observed_by: "dns",
                            timestamp: Utc::now(),
                        },
                    );
                }
                return Ok(None);
            }
        };

        let name = query.name().to_string();
        let reply = match self.classify(&name) {
            QueryClass::Local => self.handle_local(&requestor, query, request.id(), true).await?,
            QueryClass::HostnameOnly => {
                self.handle_local(&requestor, query, request.id(), false).await?
            }
            QueryClass::Reverse(addr) => match self.handle_reverse(&requestor, query, addr)? {
                Some(reply) => reply,
                None => return Ok(None),
            },
            QueryClass::External => self.handle_external(&requestor, query, request.id()).await?,
        };

        events::publish(
            self.sink.as_ref(),
            events::TOPIC_REQUEST,
            &DnsRequestEvent {
                requestor: requestor.addr.to_string(),
                protocol: "DNS",
                questions: vec![format!(
                    "{} {} {}",
                    name,
                    query.query_class(),
                    query.query_type()
                )],
                answers: reply.answers.iter().map(|record| record.to_string()).collect(),
                handler: reply.handler,
                timestamp: Utc::now(),
            },
        );
        Ok(Some(reply))
    }

    /// Local and hostname-only queries: host map first, then per-ring
    /// substitution, then the search domain, then upstream.
    pub(crate) async fn handle_local(
        &self,
        requestor: &Requestor,
        query: &LowerQuery,
        request_id: u16,
        had_domain: bool,
    ) -> Result<Reply> {
        let qtype = query.query_type();
        let qualified = self.hosts.qualify(&query.name().to_string());

        if let Some(record) = self.hosts.visible_lookup(&qualified, &requestor.ring) {
            return self.local_reply(&record, qtype);
        }
        if let Some(short) = self.hosts.per_ring_short(&qualified) {
            if let Some(record) = self.hosts.per_ring_record(&requestor.ring, &short) {
                return self.local_reply(&record, qtype);
            }
        }
        if !had_domain {
            let search = self.search_domain.lock().unwrap().clone();
            if let Some(search) = search {
                return self.search_forward(requestor, query, request_id, &search).await;
            }
        }
        self.forward(
            requestor,
            query.name().into(),
            qtype,
            query.query_class(),
            request_id,
            "local",
        )
        .await
    }

    fn local_reply(&self, record: &DnsRecord, qtype: RecordType) -> Result<Reply> {
        let name = Name::from_ascii(&record.name)?;
        let rdata = match (&record.kind, qtype) {
            (RecordKind::A(addr), RecordType::A | RecordType::ANY) => Some(RData::A(A::from(*addr))),
            (RecordKind::Cname(target), RecordType::A | RecordType::CNAME | RecordType::ANY) => {
                Some(RData::CNAME(CNAME(Name::from_ascii(target)?)))
            }
            (RecordKind::Ptr(target), RecordType::PTR | RecordType::ANY) => {
                Some(RData::PTR(PTR(Name::from_ascii(target)?)))
            }
            _ => None,
        };
        Ok(match rdata {
            Some(rdata) => Reply::local(vec![Record::from_rdata(name, self.local_ttl, rdata)]),
            None => Reply::nodata(),
        })
    }

    /// A bare hostname with a configured search domain: forward the
    /// searched form and, if it resolves, splice a CNAME from the
    /// original name onto the upstream answers.
    async fn search_forward(
        &self,
        requestor: &Requestor,
        query: &LowerQuery,
        request_id: u16,
        search: &str,
    ) -> Result<Reply> {
        let original = query.name().to_string();
        let searched = format!("{}.{}", original.trim_end_matches('.'), search);
        let searched_name = Name::from_ascii(&searched)?;

        let mut reply = self
            .forward(
                requestor,
                searched_name.clone(),
                query.query_type(),
                query.query_class(),
                request_id,
                "local",
            )
            .await?;
        if !reply.answers.is_empty() {
            let alias = Record::from_rdata(
                Name::from_ascii(&original)?,
                self.local_ttl,
                RData::CNAME(CNAME(searched_name)),
            );
            reply.answers.insert(0, alias);
        }
        Ok(reply)
    }

    /// Reverse lookups inside our subnets are answered from the host
    /// map or not at all.
    pub(crate) fn handle_reverse(
        &self,
        requestor: &Requestor,
        query: &LowerQuery,
        addr: Ipv4Addr,
    ) -> Result<Option<Reply>> {
        let reverse = hosts::reverse_name(addr);
        match self.hosts.visible_lookup(&reverse, &requestor.ring) {
            Some(record) => Ok(Some(
                self.local_reply(&record, query.query_type())?.tagged("proxy"),
            )),
            None => Ok(None),
        }
    }

    /// External queries: blocklist rewrite for phishing-ruled rings,
    /// otherwise the upstream cache.
    pub(crate) async fn handle_external(
        &self,
        requestor: &Requestor,
        query: &LowerQuery,
        request_id: u16,
    ) -> Result<Reply> {
        let name = query.name().to_string();
        let hostname = name.trim_end_matches('.');

        if rings::phishing_ruled(&requestor.ring) && self.blocklist.blocked(hostname) {
            if let Some(ring) = self.rings.get(&requestor.ring) {
                if self.warnings.should_warn_blocked(&requestor.mac, hostname) {
                    metrics::counter!(stats::DNS_BLOCKED).increment(1);
                    log::warn!(
                        "blocked hostname {} queried by {} ({})",
                        hostname,
                        requestor.mac,
                        requestor.addr
                    );
                    events::publish(
                        self.sink.as_ref(),
                        events::TOPIC_EXCEPTION,
                        &ExceptionEvent {
                            reason: events::REASON_PHISHING,
                            protocol: "DNS",
                            hostname: name.clone(),
                            mac: requestor.mac.clone(),
                            ipv4: requestor.addr.to_string(),
                            timestamp: Utc::now(),
                        },
                    );
                }
                let record = Record::from_rdata(
                    query.name().into(),
                    self.local_ttl,
                    RData::A(A::from(ring.router())),
                );
                return Ok(Reply {
                    rcode: ResponseCode::NoError,
                    authoritative: false,
                    recursion_available: true,
                    answers: vec![record],
                    name_servers: Vec::new(),
                    additionals: Vec::new(),
                    handler: "proxy",
                });
            }
        }

        self.forward(
            requestor,
            query.name().into(),
            query.query_type(),
            query.query_class(),
            request_id,
            "proxy",
        )
        .await
    }

    /// The cached upstream exchange shared by every forwarding path.
    async fn forward(
        &self,
        requestor: &Requestor,
        name: Name,
        qtype: RecordType,
        qclass: DNSClass,
        request_id: u16,
        handler: &'static str,
    ) -> Result<Reply> {
        let mut question = Query::query(name.clone(), qtype);
        question.set_query_class(qclass);
        let canonical = cache::canonical_question(&question);

        let cached = self.cache.lock().unwrap().lookup(&canonical);
        if let Some(response) = cached {
            return Ok(Reply::from_upstream(&response, handler));
        }

        let name_str = name.to_string().to_ascii_lowercase();
        let upstream = self
            .select_upstream(&name_str, &requestor.ring)
            .ok_or(DnsError::NoUpstream)?;

        let mut message = Message::new();
        message
            .set_id(request_id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true);
        message.add_query(question.clone());

        match self.forwarder.exchange(&upstream, &message).await {
            Ok(response) => {
                if cache::cacheable(&question, OpCode::Query, &response, self.cache_budget) {
                    self.cache.lock().unwrap().insert(&canonical, &response);
                }
                Ok(Reply::from_upstream(&response, handler))
            }
            Err(err) => {
                if self.upstream_failures.ready() {
                    log::warn!("upstream {} failed: {}", upstream, err);
                }
                Err(err)
            }
        }
    }
}

/// The hickory-server entry point: one shared responder behind an
/// `Arc`, cloned per listener.
#[derive(Clone)]
pub struct DnsHandler {
    responder: Arc<DnsResponder>,
}

impl DnsHandler {
    pub fn new(responder: Arc<DnsResponder>) -> Self {
        DnsHandler { responder }
    }
}

#[async_trait]
impl RequestHandler for DnsHandler {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> ResponseInfo
    where
        R: ResponseHandler + Send,
    {
        match self.responder.handle(request).await {
            Ok(Some(reply)) => {
                let mut header = Header::response_from_request(request.header());
                header.set_authoritative(reply.authoritative);
                header.set_recursion_available(reply.recursion_available);
                header.set_response_code(reply.rcode);
                let response = MessageResponseBuilder::from_message_request(request).build(
                    header,
                    reply.answers.iter(),
                    reply.name_servers.iter(),
                    &[],
                    reply.additionals.iter(),
                );
                match response_handle.send_response(response).await {
                    Ok(info) => info,
                    Err(err) => {
                        log::error!("failed to send dns response: {}", err);
                        ResponseInfo::from(*request.header())
                    }
                }
            }
            Ok(None) => ResponseInfo::from(*request.header()),
            Err(err) => {
                let rcode = match &err {
                    DnsError::InvalidOpCode(_)
                    | DnsError::InvalidMessageType(_)
                    | DnsError::BadQuestionCount(_) => ResponseCode::FormErr,
                    _ => ResponseCode::ServFail,
                };
                log::debug!("dns request from {} failed: {}", request.src(), err);
                let response = MessageResponseBuilder::from_message_request(request)
                    .error_msg(request.header(), rcode);
                match response_handle.send_response(response).await {
                    Ok(info) => info,
                    Err(send_err) => {
                        log::error!("failed to send dns error response: {}", send_err);
                        ResponseInfo::from(*request.header())
                    }
                }
            }
        }
    }
}
