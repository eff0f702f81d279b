//! Peer discovery.
//!
//! Periodic announcements on a dedicated UDP port, ingest of peer
//! announcements into the [`PeerTable`], and TTL expiry of silent peers on
//! the announce cadence. Membership is eventually consistent: a late or lost
//! announcement degrades to a slightly stale view, never to corruption.
//!
//! The discovery socket is bound with `SO_REUSEADDR`/`SO_REUSEPORT` so that
//! several nodes on one host can share the well-known port. Announcements
//! always travel as JSON.

use crate::peers::{PeerRecord, PeerTable};
use crate::transport::TransportError;
use lb_codec::{DiscoveryPacket, Packet, WireFormat, decode_packet, encode_packet};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};
use tracing::{debug, info, warn};

/// Peers silent for longer than this are dropped from the table.
pub const DEFAULT_PEER_TTL_SECS: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryMode {
    Broadcast,
    Multicast,
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Discovery port; 0 binds ephemeral (test rigs).
    pub port: u16,
    pub mode: DiscoveryMode,
    pub multicast_addr: Ipv4Addr,
    pub multicast_ttl: u32,
    /// Announce cadence; expiry shares it.
    pub interval: Duration,
    pub peer_ttl_secs: i64,
    /// When non-empty, announcements are unicast to `127.0.0.1:port` for
    /// each listed port instead of leaving the host. Single-host test rigs.
    pub loopback_targets: Vec<u16>,
}

impl Default for DiscoveryConfig {
    fn default() -> DiscoveryConfig {
        DiscoveryConfig {
            port: 39001,
            mode: DiscoveryMode::Broadcast,
            multicast_addr: Ipv4Addr::new(239, 255, 0, 1),
            multicast_ttl: 1,
            interval: Duration::from_millis(1000),
            peer_ttl_secs: DEFAULT_PEER_TTL_SECS,
            loopback_targets: Vec::new(),
        }
    }
}

/// What this node advertises about itself.
#[derive(Debug, Clone)]
pub struct Announcement {
    pub node_id: String,
    pub topics: Vec<String>,
    pub protocol_version: String,
    /// Codec preference order.
    pub formats: Vec<String>,
    /// Actual bound data port, not the configured one.
    pub data_port: u16,
    pub stream_port: Option<u16>,
}

/// Membership changes, for observers that want more than table reads.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    Updated(PeerRecord),
    Expired(String),
}

pub struct Discovery {
    sock: Arc<UdpSocket>,
    interval: Arc<Mutex<Duration>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Discovery {
    /// Bind the discovery socket and start the announce, ingest and expiry
    /// loops. `events` is advisory: sends never block and are dropped when
    /// the receiver lags or is gone.
    pub async fn start(
        cfg: DiscoveryConfig,
        announcement: Announcement,
        table: Arc<PeerTable>,
        events: Option<mpsc::Sender<PeerEvent>>,
    ) -> Result<Discovery, TransportError> {
        let sock = Arc::new(bind_discovery_socket(&cfg)?);
        info!(
            port = sock.local_addr().map(|a| a.port()).unwrap_or(0),
            mode = ?cfg.mode,
            "discovery socket bound"
        );

        let interval = Arc::new(Mutex::new(cfg.interval));
        let mut tasks = Vec::new();

        tasks.push(spawn_announce_loop(
            cfg.clone(),
            announcement.clone(),
            Arc::clone(&sock),
            Arc::clone(&interval),
            Arc::clone(&table),
            events.clone(),
        ));
        tasks.push(spawn_ingest_loop(
            announcement.node_id,
            Arc::clone(&sock),
            table,
            events,
        ));

        Ok(Discovery {
            sock,
            interval,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn bound_port(&self) -> u16 {
        self.sock.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Change the announce cadence at runtime (hot-reload target). Takes
    /// effect on the next loop iteration.
    pub fn set_interval(&self, interval: Duration) {
        *self.interval.lock().expect("interval lock poisoned") = interval;
        info!(interval_ms = interval.as_millis() as u64, "discovery interval updated");
    }

    /// Stop announcing and ingesting. The peer table keeps its last state.
    pub fn stop(&self) {
        for task in self.tasks.lock().expect("task list lock poisoned").drain(..) {
            task.abort();
        }
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Socket setup
// ---------------------------------------------------------------------------

fn bind_discovery_socket(cfg: &DiscoveryConfig) -> Result<UdpSocket, TransportError> {
    let socket =
        Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(TransportError::Bind)?;
    socket
        .set_reuse_address(true)
        .map_err(TransportError::Bind)?;
    set_reuse_port(&socket);
    socket.set_nonblocking(true).map_err(TransportError::Bind)?;

    let bind_addr: SocketAddr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, cfg.port).into();
    socket
        .bind(&bind_addr.into())
        .map_err(TransportError::Bind)?;
    socket.set_broadcast(true).map_err(TransportError::Bind)?;

    if cfg.mode == DiscoveryMode::Multicast && cfg.loopback_targets.is_empty() {
        if let Err(e) = socket.join_multicast_v4(&cfg.multicast_addr, &Ipv4Addr::UNSPECIFIED) {
            warn!(group = %cfg.multicast_addr, error = %e, "multicast join failed");
        }
        if let Err(e) = socket.set_multicast_ttl_v4(cfg.multicast_ttl) {
            warn!(error = %e, "setting multicast ttl failed");
        }
    }

    UdpSocket::from_std(socket.into()).map_err(TransportError::Bind)
}

#[cfg(unix)]
fn set_reuse_port(socket: &Socket) {
    if let Err(e) = socket.set_reuse_port(true) {
        warn!(error = %e, "SO_REUSEPORT not available");
    }
}

#[cfg(not(unix))]
fn set_reuse_port(_socket: &Socket) {}

// ---------------------------------------------------------------------------
// Announce + expiry loop
// ---------------------------------------------------------------------------

fn spawn_announce_loop(
    cfg: DiscoveryConfig,
    ann: Announcement,
    sock: Arc<UdpSocket>,
    interval: Arc<Mutex<Duration>>,
    table: Arc<PeerTable>,
    events: Option<mpsc::Sender<PeerEvent>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // First announce goes out promptly, not a full interval later.
        sleep(Duration::from_millis(10)).await;
        loop {
            announce_once(&cfg, &ann, &sock).await;

            // Expiry shares the announce cadence.
            let now = chrono::Utc::now().timestamp();
            for node_id in table.expire_older_than(now, cfg.peer_ttl_secs) {
                info!(peer = %node_id, "discovery: peer expired");
                emit(&events, PeerEvent::Expired(node_id));
            }

            let pause = *interval.lock().expect("interval lock poisoned");
            sleep(pause).await;
        }
    })
}

async fn announce_once(cfg: &DiscoveryConfig, ann: &Announcement, sock: &UdpSocket) {
    let packet = Packet::Discovery(DiscoveryPacket {
        node_id: ann.node_id.clone(),
        topics: ann.topics.clone(),
        protocol_version: ann.protocol_version.clone(),
        timestamp: chrono::Utc::now().timestamp(),
        data_port: ann.data_port,
        serialization: ann.formats.clone(),
        udp_port: Some(ann.data_port),
        tcp_port: ann.stream_port,
    });
    let bytes = match encode_packet(&packet, WireFormat::Json) {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "discovery announce encode failed");
            return;
        }
    };

    if cfg.loopback_targets.is_empty() {
        let dest: SocketAddr = match cfg.mode {
            DiscoveryMode::Broadcast => {
                SocketAddrV4::new(Ipv4Addr::BROADCAST, cfg.port).into()
            }
            DiscoveryMode::Multicast => SocketAddrV4::new(cfg.multicast_addr, cfg.port).into(),
        };
        if let Err(e) = sock.send_to(&bytes, dest).await {
            warn!(dest = %dest, error = %e, "discovery announce failed");
        } else {
            debug!(node = %ann.node_id, dest = %dest, "discovery announce");
        }
    } else {
        for port in &cfg.loopback_targets {
            let dest = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), *port);
            if let Err(e) = sock.send_to(&bytes, dest).await {
                warn!(dest = %dest, error = %e, "discovery announce failed");
            }
        }
        debug!(node = %ann.node_id, targets = cfg.loopback_targets.len(), "discovery announce (loopback)");
    }
}

// ---------------------------------------------------------------------------
// Ingest loop
// ---------------------------------------------------------------------------

fn spawn_ingest_loop(
    our_node_id: String,
    sock: Arc<UdpSocket>,
    table: Arc<PeerTable>,
    events: Option<mpsc::Sender<PeerEvent>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let (n, from) = match sock.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "discovery recv failed");
                    continue;
                }
            };
            match decode_packet(&buf[..n]) {
                Ok(Packet::Discovery(pkt)) => {
                    if pkt.node_id.is_empty() || pkt.node_id == our_node_id {
                        continue;
                    }
                    let record = PeerRecord {
                        node_id: pkt.node_id.clone(),
                        topics: pkt.topics,
                        protocol_version: pkt.protocol_version,
                        last_seen: chrono::Utc::now().timestamp(),
                        host: from.ip(),
                        formats: pkt.serialization,
                        // The announced bound port wins over the nominal one.
                        data_port: pkt.udp_port.unwrap_or(pkt.data_port),
                        stream_port: pkt.tcp_port,
                    };
                    info!(
                        peer = %record.node_id,
                        topics = record.topics.len(),
                        version = %record.protocol_version,
                        "discovery: peer updated"
                    );
                    table.upsert(record.clone());
                    emit(&events, PeerEvent::Updated(record));
                }
                Ok(other) => {
                    debug!(kind = other.kind(), from = %from, "non-discovery packet on discovery port");
                }
                Err(e) => {
                    debug!(from = %from, error = %e, "discovery decode failed, dropping");
                }
            }
        }
    })
}

fn emit(events: &Option<mpsc::Sender<PeerEvent>>, event: PeerEvent) {
    if let Some(tx) = events {
        let _ = tx.try_send(event);
    }
}
