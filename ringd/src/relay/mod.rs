//! The multicast service relay.
//!
//! One worker task per relayed service (mDNS, SSDP). A worker joins
//! the service's multicast group on every ring interface, parses and
//! publishes each ingress packet, and re-transmits it to every other
//! ring the relay policy permits. Workers shut down cooperatively:
//! restart flips each worker's done signal, interrupts the blocked
//! read, and waits on the worker's completion channel before spawning
//! replacements.

pub mod mdns;
pub mod ssdp;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch, Mutex};

use crate::error::app::AppError;
use crate::events::EventSink;
use crate::rings::{self, RingMap};

use ssdp::SsdpPool;

/// Largest packet either service will hand us; mDNS allows jumbo
/// payloads well past the SSDP norm.
const MAX_PACKET: usize = 9000;

const MULTICAST_TTL: u32 = 255;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceKind {
    Mdns,
    Ssdp,
}

/// A relayed service: the group/port it lives on and the parser that
/// inspects its packets.
#[derive(Clone, Copy, Debug)]
pub struct Service {
    pub name: &'static str,
    pub group: Ipv4Addr,
    pub port: u16,
    pub kind: ServiceKind,
}

pub const SERVICES: &[Service] = &[
    Service {
        name: "mdns",
        group: Ipv4Addr::new(224, 0, 0, 251),
        port: 5353,
        kind: ServiceKind::Mdns,
    },
    Service {
        name: "ssdp",
        group: Ipv4Addr::new(239, 255, 255, 250),
        port: 1900,
        kind: ServiceKind::Ssdp,
    },
];

/// Where a packet came from and which socket its onward copies should
/// be written from. SSDP M-SEARCH handling swaps `socket` for an
/// ephemeral reply port so responders answer there.
pub struct Endpoint {
    pub addr: SocketAddr,
    pub ring: String,
    pub iface: String,
    pub socket: Arc<UdpSocket>,
}

pub struct RelayOptions {
    pub ssdp_base: u16,
    pub ssdp_pool: usize,
}

impl Default for RelayOptions {
    fn default() -> Self {
        RelayOptions {
            ssdp_base: 31000,
            ssdp_pool: 20,
        }
    }
}

struct Worker {
    name: &'static str,
    done: watch::Sender<bool>,
    exited: oneshot::Receiver<()>,
}

pub struct Relay {
    rings: Arc<RingMap>,
    sink: Arc<dyn EventSink>,
    ssdp: Arc<SsdpPool>,
    /// Per-direction policy switches; both directions are currently
    /// enabled.
    relay_up: bool,
    relay_down: bool,
    workers: Mutex<Vec<Worker>>,
}

impl Relay {
    /// Open the SSDP reply pool, install its firewall rule, and spawn
    /// one worker per service.
    pub async fn start(
        tree: &cfgtree::ConfigTree,
        rings: Arc<RingMap>,
        sink: Arc<dyn EventSink>,
        options: RelayOptions,
    ) -> Result<Arc<Relay>, AppError> {
        let ssdp = Arc::new(SsdpPool::open(options.ssdp_base, options.ssdp_pool).await?);
        ssdp::install_firewall_rule(tree, options.ssdp_base, options.ssdp_pool);

        let relay = Arc::new(Relay {
            rings,
            sink,
            ssdp,
            relay_up: true,
            relay_down: true,
            workers: Mutex::new(Vec::new()),
        });
        let workers = relay.spawn_workers()?;
        *relay.workers.lock().await = workers;
        Ok(relay)
    }

    fn spawn_workers(self: &Arc<Self>) -> Result<Vec<Worker>, AppError> {
        let mut workers = Vec::with_capacity(SERVICES.len());
        for service in SERVICES {
            let socket = Arc::new(open_service_socket(&self.rings, service)?);
            let (done_tx, done_rx) = watch::channel(false);
            let (exited_tx, exited_rx) = oneshot::channel();
            tokio::spawn(Arc::clone(self).worker_loop(*service, socket, done_rx, exited_tx));
            workers.push(Worker {
                name: service.name,
                done: done_tx,
                exited: exited_rx,
            });
            log::info!(
                "relay worker {} on {}:{}",
                service.name,
                service.group,
                service.port
            );
        }
        Ok(workers)
    }

    /// Tear every worker down and spawn a fresh set. Invoked when the
    /// ring/interface topology changes.
    pub async fn restart(self: &Arc<Self>) {
        log::info!("relay restart");
        let mut workers = self.workers.lock().await;
        for worker in workers.iter() {
            let _ = worker.done.send(true);
        }
        for worker in workers.drain(..) {
            if worker.exited.await.is_err() {
                log::warn!("relay worker {} exited uncleanly", worker.name);
            }
        }
        match self.spawn_workers() {
            Ok(fresh) => *workers = fresh,
            Err(err) => log::error!("relay restart failed: {}", err),
        }
    }

    /// Restart on ring topology changes; runs until the tree goes
    /// away.
    pub async fn watch_config(self: Arc<Self>, tree: Arc<cfgtree::ConfigTree>) {
        let mut events = tree.watch();
        loop {
            match events.recv().await {
                Ok(event) if event.path.starts_with(cfgtree::paths::RINGS) => {
                    self.restart().await;
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    log::warn!("relay config watcher lagged, {} events lost", missed);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    async fn worker_loop(
        self: Arc<Self>,
        service: Service,
        socket: Arc<UdpSocket>,
        mut done: watch::Receiver<bool>,
        exited: oneshot::Sender<()>,
    ) {
        let mut buf = [0u8; MAX_PACKET];
        loop {
            let (len, src) = tokio::select! {
                _ = done.changed() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok(pair) => pair,
                    Err(err) => {
                        if *done.borrow() {
                            break;
                        }
                        log::warn!("{} read error: {}", service.name, err);
                        continue;
                    }
                },
            };

            let mut endpoint = match self.classify_origin(src, &socket) {
                Some(endpoint) => endpoint,
                None => continue,
            };
            let handled = match service.kind {
                ServiceKind::Mdns => mdns::handle(self.sink.as_ref(), &endpoint, &buf[..len]),
                ServiceKind::Ssdp => {
                    ssdp::handle(&self.ssdp, self.sink.as_ref(), &mut endpoint, &buf[..len]).await
                }
            };
            match handled {
                Ok(packet) => self.forward(&service, &endpoint, &packet).await,
                Err(err) => log::debug!("{} packet from {} dropped: {}", service.name, src, err),
            }
        }
        let _ = exited.send(());
    }

    /// Apply the ingress drop rules: ignore our own transmissions and
    /// anything from an address outside every ring subnet.
    fn classify_origin(&self, src: SocketAddr, socket: &Arc<UdpSocket>) -> Option<Endpoint> {
        let v4 = match src.ip() {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(_) => return None,
        };
        if self.rings.is_local_address(v4) {
            return None;
        }
        let ring = match self.rings.ring_for_ip(v4) {
            Some(ring) => ring,
            None => {
                log::debug!("multicast from unmapped source {}", src);
                return None;
            }
        };
        Some(Endpoint {
            addr: src,
            ring: ring.name.clone(),
            iface: ring.iface.clone(),
            socket: Arc::clone(socket),
        })
    }

    fn should_relay(&self, src_level: u32, dst_level: u32) -> bool {
        if dst_level < src_level {
            self.relay_up
        } else {
            self.relay_down
        }
    }

    /// Re-transmit an accepted packet to every other ring the policy
    /// allows, selecting the egress interface per destination.
    async fn forward(&self, service: &Service, endpoint: &Endpoint, packet: &[u8]) {
        let src_level = match rings::ring_level(&endpoint.ring) {
            Some(level) => level,
            None => {
                log::debug!("no trust level for ring {}, not relaying", endpoint.ring);
                return;
            }
        };
        let dest = SocketAddr::from((service.group, service.port));

        for ring in self.rings.iter() {
            if ring.name == endpoint.ring {
                continue;
            }
            if !self.should_relay(src_level, ring.level) {
                continue;
            }
            let sock = SockRef::from(endpoint.socket.as_ref());
            if let Err(err) = sock.set_multicast_if_v4(&ring.router()) {
                log::warn!("{}: egress {} unavailable: {}", service.name, ring.name, err);
                continue;
            }
            if let Err(err) = sock.set_multicast_ttl_v4(MULTICAST_TTL) {
                log::warn!("{}: ttl on {}: {}", service.name, ring.name, err);
            }
            if let Err(err) = endpoint.socket.send_to(packet, dest).await {
                log::warn!("{} relay to {} failed: {}", service.name, ring.name, err);
            }
        }
    }
}

/// A service socket: bound to the service port, joined to the group
/// on every ring interface, loud enough to cross the whole segment.
fn open_service_socket(rings: &RingMap, service: &Service) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    let bind: SocketAddr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, service.port));
    socket.bind(&bind.into())?;
    for ring in rings.iter() {
        if let Err(err) = socket.join_multicast_v4(&service.group, &ring.router()) {
            log::warn!(
                "{}: join {} on {} ({}): {}",
                service.name,
                service.group,
                ring.name,
                ring.iface,
                err
            );
        }
    }
    socket.set_multicast_ttl_v4(MULTICAST_TTL)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LogSink;
    use crate::rings::testutil::test_rings;

    async fn test_relay() -> Arc<Relay> {
        Arc::new(Relay {
            rings: Arc::new(test_rings()),
            sink: Arc::new(LogSink),
            ssdp: Arc::new(SsdpPool::open(0, 2).await.unwrap()),
            relay_up: true,
            relay_down: true,
            workers: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn origin_classification_applies_drop_rules() {
        let relay = test_relay().await;
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());

        // A client inside the devices subnet maps to its ring.
        let endpoint = relay
            .classify_origin("192.168.20.44:5353".parse().unwrap(), &socket)
            .unwrap();
        assert_eq!(endpoint.ring, "devices");

        // Our own router address: a packet we just emitted.
        assert!(relay
            .classify_origin("192.168.10.1:5353".parse().unwrap(), &socket)
            .is_none());

        // Outside every ring subnet.
        assert!(relay
            .classify_origin("10.9.8.7:5353".parse().unwrap(), &socket)
            .is_none());
    }

    #[tokio::test]
    async fn both_relay_directions_are_enabled() {
        let relay = test_relay().await;
        // standard (2) → core (0) is up, standard → guest (4) is down.
        assert!(relay.should_relay(2, 0));
        assert!(relay.should_relay(2, 4));
    }
}
