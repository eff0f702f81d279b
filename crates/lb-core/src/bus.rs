//! The bus engine.
//!
//! Owns the pending tracker, dedup caches, retain-last store and subscriber
//! bindings; references the peer table for routing; transports are injected
//! and outlive the engine.
//!
//! # Publish path
//! Assign a monotonic message id, retain, deliver locally, then route:
//! reliable publishes unicast to every peer advertising the topic (each send
//! registered with the tracker), best-effort publishes broadcast once in our
//! preferred format. Reliable publishes with no routable peer are dropped —
//! never broadcast — so the pending set stays bounded.
//!
//! # Receive path
//! Decode, drop our own traffic, dedup, deliver, and acknowledge reliable
//! data back to the origin. ACKs always travel as JSON: the traffic is tiny
//! and an always-decodable format keeps the ack path independent of
//! negotiation state.

use crate::dedup::DedupState;
use crate::peers::{PeerRecord, PeerTable};
use crate::pending::{DeadLetter, PendingEntry, PendingTracker, TrackerEvent};
use crate::stream::StreamTransport;
use crate::transport::{Inbound, UdpTransport};
use lb_codec::{
    self as codec, AckPacket, MessageEnvelope, Packet, Qos, WireFormat, frame, is_reliable,
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep};
use tracing::{debug, error, info, warn};

/// Cadence of the retransmit scan. The tick is the sole progress mechanism
/// for reliable delivery.
const TRACKER_TICK: Duration = Duration::from_millis(30);

/// Slice width of the shutdown drain loop.
const DRAIN_SLICE: Duration = Duration::from_millis(10);

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Reliable-delivery knobs.
#[derive(Debug, Clone)]
pub struct ReliableConfig {
    pub ack_timeout_ms: u64,
    pub max_retries: u32,
    pub exponential_backoff: bool,
}

impl Default for ReliableConfig {
    fn default() -> ReliableConfig {
        ReliableConfig {
            ack_timeout_ms: 300,
            max_retries: 3,
            exponential_backoff: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QosConfig {
    pub default_qos: Qos,
    pub reliable: ReliableConfig,
    pub dedup_capacity: usize,
    pub retain_last: bool,
}

impl Default for QosConfig {
    fn default() -> QosConfig {
        QosConfig {
            default_qos: Qos::BestEffort,
            reliable: ReliableConfig::default(),
            dedup_capacity: 1024,
            retain_last: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SerializationConfig {
    /// Our preferred format for best-effort traffic.
    pub format: String,
    /// Preference order advertised to peers.
    pub supported: Vec<String>,
    pub allow_json_fallback: bool,
}

impl Default for SerializationConfig {
    fn default() -> SerializationConfig {
        SerializationConfig {
            format: "json".to_owned(),
            supported: vec!["json".to_owned(), "cbor".to_owned()],
            allow_json_fallback: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub node_id: String,
    pub protocol_version: String,
    pub qos: QosConfig,
    pub serialization: SerializationConfig,
    /// Well-known data port that best-effort broadcasts target.
    pub data_port: u16,
    pub deadletter_file: Option<PathBuf>,
    /// Redirect best-effort broadcast to `127.0.0.1`; single-host test rigs.
    pub loopback: bool,
}

impl Default for BusConfig {
    fn default() -> BusConfig {
        BusConfig {
            node_id: "node".to_owned(),
            protocol_version: "1.0".to_owned(),
            qos: QosConfig::default(),
            serialization: SerializationConfig::default(),
            data_port: 39000,
            deadletter_file: None,
            loopback: false,
        }
    }
}

/// Subscriber callback. Receives the payload enriched with `topic`, `qos`
/// and `message_id` so consumers see metadata without a side channel.
pub type SubscriberFn = dyn Fn(&Map<String, Value>) + Send + Sync;

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

pub struct Bus {
    cfg: BusConfig,
    transport: Arc<UdpTransport>,
    peers: Arc<PeerTable>,
    tracker: Mutex<PendingTracker>,
    dedup: Mutex<DedupState>,
    subs: Mutex<HashMap<String, Arc<SubscriberFn>>>,
    retain: Mutex<HashMap<String, MessageEnvelope>>,
    /// Negotiated format per peer, for the life of the record.
    peer_formats: Mutex<HashMap<String, WireFormat>>,
    stream: Mutex<Option<Arc<StreamTransport>>>,
    next_msg_id: AtomicI64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Bus {
    pub fn new(cfg: BusConfig, transport: Arc<UdpTransport>, peers: Arc<PeerTable>) -> Arc<Bus> {
        let dedup_capacity = cfg.qos.dedup_capacity;
        let deadletter = cfg.deadletter_file.clone();
        Arc::new(Bus {
            cfg,
            transport,
            peers,
            tracker: Mutex::new(PendingTracker::new(deadletter)),
            dedup: Mutex::new(DedupState::new(dedup_capacity)),
            subs: Mutex::new(HashMap::new()),
            retain: Mutex::new(HashMap::new()),
            peer_formats: Mutex::new(HashMap::new()),
            stream: Mutex::new(None),
            next_msg_id: AtomicI64::new(1),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the datagram pump and the retransmit tick loop.
    pub fn start(self: &Arc<Self>) {
        let (tx, mut rx) = mpsc::channel::<Inbound>(1024);
        let pump = self.transport.spawn_recv(tx);

        let bus = Arc::clone(self);
        let ingest = tokio::spawn(async move {
            while let Some(inbound) = rx.recv().await {
                bus.handle_datagram(&inbound.bytes, inbound.from).await;
            }
        });

        let bus = Arc::clone(self);
        let ticker = tokio::spawn(async move {
            loop {
                sleep(TRACKER_TICK).await;
                let events = bus.lock_tracker().tick(now_ms());
                for event in events {
                    bus.apply_tracker_event(event).await;
                }
            }
        });

        self.tasks
            .lock()
            .expect("task list lock poisoned")
            .extend([pump, ingest, ticker]);
    }

    pub fn node_id(&self) -> &str {
        &self.cfg.node_id
    }

    /// Route frames from an attached stream transport through this engine;
    /// ACKs for stream-delivered data go back out as stream frames.
    pub fn attach_stream(&self, stream: Arc<StreamTransport>) {
        *self.stream.lock().expect("stream lock poisoned") = Some(stream);
    }

    // -----------------------------------------------------------------------
    // Publish path
    // -----------------------------------------------------------------------

    /// Publish `payload` on `topic`. Returns the assigned message id;
    /// reliability outcomes are observable through dead-letter emissions and
    /// [`Bus::pending_len`], never as errors here.
    pub async fn publish(&self, topic: &str, payload: Map<String, Value>, qos: Qos) -> i64 {
        let message_id = self.next_msg_id.fetch_add(1, Ordering::Relaxed);
        let envelope = MessageEnvelope {
            topic: topic.to_owned(),
            message_id,
            timestamp: chrono::Utc::now().timestamp(),
            payload,
            publisher_id: self.cfg.node_id.clone(),
            qos: qos.as_str().to_owned(),
        };

        if self.cfg.qos.retain_last {
            self.lock_retain()
                .insert(topic.to_owned(), envelope.clone());
        }

        // A publisher is also a subscriber of its own process.
        self.deliver_local(&envelope);

        match qos {
            Qos::Reliable => self.send_reliable(&envelope).await,
            Qos::BestEffort => self.send_best_effort(&envelope).await,
        }

        message_id
    }

    async fn send_reliable(&self, envelope: &MessageEnvelope) {
        let dests = self.peers.peers_for_topic(&envelope.topic);
        if dests.is_empty() {
            warn!(
                topic = %envelope.topic,
                mid = envelope.message_id,
                "no routable peers for reliable publish, dropping"
            );
            return;
        }

        // One encode per codec per publish, however many peers share it.
        let mut encoded: HashMap<WireFormat, Vec<u8>> = HashMap::new();

        for peer in dests {
            let Some(format) = self.format_for_peer(&peer) else {
                continue;
            };
            let bytes = match encoded.get(&format) {
                Some(b) => b.clone(),
                None => {
                    match codec::encode_packet(&Packet::Data(envelope.clone()), format) {
                        Ok(b) => {
                            encoded.insert(format, b.clone());
                            b
                        }
                        Err(e) => {
                            error!(error = %e, format = %format, "envelope encode failed");
                            continue;
                        }
                    }
                }
            };

            let dest = SocketAddr::new(peer.host, peer.data_port);
            debug!(
                topic = %envelope.topic,
                mid = envelope.message_id,
                peer = %peer.node_id,
                dest = %dest,
                format = %format,
                "reliable unicast"
            );
            if let Err(e) = self.transport.send(&bytes, peer.host, peer.data_port).await {
                // The pending timer covers it from here.
                warn!(error = %e, peer = %peer.node_id, mid = envelope.message_id, "send failed");
            }

            let reliable = &self.cfg.qos.reliable;
            self.lock_tracker().track(PendingEntry {
                packet: bytes,
                to: dest,
                message_id: envelope.message_id,
                receiver_id: peer.node_id.clone(),
                retries_left: reliable.max_retries,
                attempt: 0,
                base_timeout_ms: reliable.ack_timeout_ms,
                deadline_ms: now_ms() + reliable.ack_timeout_ms as i64,
                exponential_backoff: reliable.exponential_backoff,
            });
        }
    }

    async fn send_best_effort(&self, envelope: &MessageEnvelope) {
        let format =
            WireFormat::parse(&self.cfg.serialization.format).unwrap_or(WireFormat::Json);
        let bytes = match codec::encode_packet(&Packet::Data(envelope.clone()), format) {
            Ok(b) => b,
            Err(e) => {
                error!(error = %e, "envelope encode failed");
                return;
            }
        };
        let port = self.cfg.data_port;
        let result = if self.cfg.loopback {
            self.transport
                .send(&bytes, IpAddr::V4(Ipv4Addr::LOCALHOST), port)
                .await
        } else {
            self.transport.send_broadcast(&bytes, port).await
        };
        match result {
            Ok(()) => debug!(
                topic = %envelope.topic,
                mid = envelope.message_id,
                format = %format,
                "best-effort broadcast"
            ),
            Err(e) => warn!(error = %e, mid = envelope.message_id, "broadcast failed"),
        }
    }

    /// Resolve the wire format for a peer, negotiating on first contact and
    /// caching the result for the life of the record.
    fn format_for_peer(&self, peer: &PeerRecord) -> Option<WireFormat> {
        if let Some(format) = self
            .peer_formats
            .lock()
            .expect("format cache lock poisoned")
            .get(&peer.node_id)
        {
            return Some(*format);
        }

        let supported = &self.cfg.serialization.supported;
        let name = match codec::negotiate_format(supported, &peer.formats) {
            Some(name) => name,
            None if self.cfg.serialization.allow_json_fallback => {
                warn!(peer = %peer.node_id, "no mutual wire format, falling back to json");
                "json".to_owned()
            }
            None => {
                error!(
                    peer = %peer.node_id,
                    "no mutual wire format and fallback disabled, skipping destination"
                );
                return None;
            }
        };
        let format = WireFormat::parse(&name).unwrap_or(WireFormat::Json);
        info!(peer = %peer.node_id, format = %format, "negotiated wire format");
        self.peer_formats
            .lock()
            .expect("format cache lock poisoned")
            .insert(peer.node_id.clone(), format);
        Some(format)
    }

    // -----------------------------------------------------------------------
    // Subscribe / retain-last
    // -----------------------------------------------------------------------

    /// Register the callback for `topic`, replacing any prior binding. With
    /// retain-last enabled the most recent envelope is delivered immediately.
    pub fn subscribe<F>(&self, topic: &str, callback: F)
    where
        F: Fn(&Map<String, Value>) + Send + Sync + 'static,
    {
        self.lock_subs()
            .insert(topic.to_owned(), Arc::new(callback));
        info!(
            topic = %topic,
            peers = self.peers.peers_for_topic(topic).len(),
            "subscription registered"
        );

        if self.cfg.qos.retain_last {
            let retained = self.lock_retain().get(topic).cloned();
            if let Some(envelope) = retained {
                self.deliver_local(&envelope);
            }
        }
    }

    fn deliver_local(&self, envelope: &MessageEnvelope) {
        let mut enriched = envelope.payload.clone();
        enriched.insert("topic".to_owned(), Value::String(envelope.topic.clone()));
        enriched.insert("qos".to_owned(), Value::String(envelope.qos.clone()));
        enriched.insert("message_id".to_owned(), Value::from(envelope.message_id));

        // Clone the callback out so a subscriber that re-enters the bus
        // never sees the binding map locked.
        let callback = self.lock_subs().get(&envelope.topic).cloned();
        if let Some(cb) = callback {
            cb(&enriched);
        }
    }

    // -----------------------------------------------------------------------
    // Receive path
    // -----------------------------------------------------------------------

    /// Process one inbound datagram from the data socket.
    pub async fn handle_datagram(&self, bytes: &[u8], from: SocketAddr) {
        let packet = match codec::decode_packet(bytes) {
            Ok(p) => p,
            Err(e) => {
                warn!(from = %from, error = %e, "dropping undecodable datagram");
                return;
            }
        };
        match packet {
            Packet::Data(envelope) => self.handle_data(envelope, Some(from)).await,
            Packet::Ack(ack) => self.handle_ack(&ack),
            Packet::Discovery(_) => {
                debug!(from = %from, "discovery packet on data port, ignoring");
            }
        }
    }

    /// Process one frame from the attached stream transport.
    pub async fn handle_stream_frame(&self, msg_type: u8, payload: &[u8], from: SocketAddr) {
        match msg_type {
            frame::MSG_DATA => match codec::decode_packet(payload) {
                Ok(Packet::Data(envelope)) => self.handle_data(envelope, None).await,
                Ok(other) => debug!(kind = other.kind(), "unexpected packet in data frame"),
                Err(e) => warn!(from = %from, error = %e, "dropping undecodable data frame"),
            },
            frame::MSG_ACK => match codec::decode_packet(payload) {
                Ok(Packet::Ack(ack)) => self.handle_ack(&ack),
                Ok(other) => debug!(kind = other.kind(), "unexpected packet in ack frame"),
                Err(e) => warn!(from = %from, error = %e, "dropping undecodable ack frame"),
            },
            other => debug!(msg_type = other, from = %from, "unknown stream frame type"),
        }
    }

    /// Dedup, deliver, acknowledge. `reply_to` is the datagram origin; `None`
    /// means the envelope arrived over the stream transport and the ACK goes
    /// back as a frame.
    async fn handle_data(&self, envelope: MessageEnvelope, reply_to: Option<SocketAddr>) {
        if envelope.publisher_id == self.cfg.node_id {
            return;
        }

        let fresh = self.lock_dedup().observe(
            &envelope.publisher_id,
            &envelope.topic,
            envelope.message_id,
        );
        if !fresh {
            debug!(
                topic = %envelope.topic,
                mid = envelope.message_id,
                publisher = %envelope.publisher_id,
                "duplicate, skipping"
            );
            return;
        }

        // A late local subscriber to a remotely-published topic still gets
        // the latest value.
        if self.cfg.qos.retain_last {
            self.lock_retain()
                .insert(envelope.topic.clone(), envelope.clone());
        }

        self.deliver_local(&envelope);

        if is_reliable(&envelope.qos) {
            self.send_ack(envelope.message_id, reply_to).await;
        }
    }

    async fn send_ack(&self, message_id: i64, reply_to: Option<SocketAddr>) {
        let ack = Packet::Ack(AckPacket {
            message_id,
            receiver_node_id: self.cfg.node_id.clone(),
            status: "ACK".to_owned(),
            timestamp: chrono::Utc::now().timestamp(),
        });
        let bytes = match codec::encode_packet(&ack, WireFormat::Json) {
            Ok(b) => b,
            Err(e) => {
                error!(error = %e, mid = message_id, "ack encode failed");
                return;
            }
        };
        match reply_to {
            Some(addr) => {
                if let Err(e) = self.transport.send(&bytes, addr.ip(), addr.port()).await {
                    warn!(error = %e, mid = message_id, to = %addr, "ack send failed");
                } else {
                    debug!(mid = message_id, to = %addr, "ack sent");
                }
            }
            None => {
                let stream = self.stream.lock().expect("stream lock poisoned").clone();
                match stream {
                    Some(stream) => {
                        if !stream.broadcast_frame(frame::MSG_ACK, &bytes).await {
                            warn!(mid = message_id, "no live stream peers for ack");
                        }
                    }
                    None => warn!(mid = message_id, "stream frame ack without attached stream"),
                }
            }
        }
    }

    fn handle_ack(&self, ack: &AckPacket) {
        let matched = self
            .lock_tracker()
            .ack_received(ack.message_id, &ack.receiver_node_id);
        if matched {
            debug!(mid = ack.message_id, receiver = %ack.receiver_node_id, "ack matched");
        } else {
            debug!(
                mid = ack.message_id,
                receiver = %ack.receiver_node_id,
                "ack without pending entry, ignoring"
            );
        }
    }

    async fn apply_tracker_event(&self, event: TrackerEvent) {
        match event {
            TrackerEvent::Resend {
                to,
                packet,
                message_id,
                attempt,
                ..
            } => {
                debug!(mid = message_id, to = %to, attempt, "resending unacked packet");
                if let Err(e) = self.transport.send(&packet, to.ip(), to.port()).await {
                    warn!(error = %e, mid = message_id, "resend failed");
                }
            }
            TrackerEvent::Failed {
                message_id,
                receiver_id,
            } => {
                warn!(mid = message_id, receiver = %receiver_id, "reliable delivery failed");
            }
            TrackerEvent::DeadLettered {
                message_id,
                receiver_id,
                attempts,
                reason,
            } => {
                warn!(
                    mid = message_id,
                    receiver = %receiver_id,
                    attempts,
                    reason,
                    "dead-lettered"
                );
            }
        }
    }

    // -----------------------------------------------------------------------
    // Shutdown and observability
    // -----------------------------------------------------------------------

    /// Drain the pending tracker in small slices until it empties or the
    /// budget elapses, then stop the engine tasks. Discovery is stopped by
    /// the caller afterwards.
    pub async fn shutdown(&self, timeout_ms: u64) {
        info!(pending = self.pending_len(), "bus shutdown: draining");
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        while self.lock_tracker().has_pending() && Instant::now() < deadline {
            sleep(DRAIN_SLICE).await;
        }
        let drained = !self.lock_tracker().has_pending();
        for task in self.tasks.lock().expect("task list lock poisoned").drain(..) {
            task.abort();
        }
        info!(drained, "bus stopped");
    }

    pub fn pending_len(&self) -> usize {
        self.lock_tracker().pending_len()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock_tracker().dead_letters().iter().cloned().collect()
    }

    pub fn ack_count(&self) -> u64 {
        self.lock_tracker().ack_count()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    // -----------------------------------------------------------------------
    // Lock helpers
    // -----------------------------------------------------------------------

    fn lock_tracker(&self) -> MutexGuard<'_, PendingTracker> {
        self.tracker.lock().expect("tracker lock poisoned")
    }

    fn lock_dedup(&self) -> MutexGuard<'_, DedupState> {
        self.dedup.lock().expect("dedup lock poisoned")
    }

    fn lock_subs(&self) -> MutexGuard<'_, HashMap<String, Arc<SubscriberFn>>> {
        self.subs.lock().expect("subscriber map lock poisoned")
    }

    fn lock_retain(&self) -> MutexGuard<'_, HashMap<String, MessageEnvelope>> {
        self.retain.lock().expect("retain map lock poisoned")
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
