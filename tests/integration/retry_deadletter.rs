//! Retry then dead-letter against a receiver that silently drops data.
//!
//! With `ack_timeout_ms = 80`, `max_retries = 2` and exponential backoff the
//! wire must carry the initial send plus two resends (roughly 80 ms and
//! 160 ms apart), then the entry dead-letters with `attempts = 2` and one
//! NDJSON line lands in the dead-letter file.

use lb_codec::Qos;
use lb_core::{Bus, BusConfig, PeerRecord, PeerTable, QosConfig, ReliableConfig, UdpTransport};
use lb_test_utils::{CaptureMode, CaptureSocket, object, wait_for};
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::Duration;

#[tokio::test]
async fn retries_then_dead_letters_with_backoff() {
    let dir = tempfile::tempdir().unwrap();
    let deadletter_path = dir.path().join("deadletter.ndjson");

    let transport = Arc::new(UdpTransport::bind(0).await.unwrap());
    let peers = Arc::new(PeerTable::new());
    let cfg = BusConfig {
        node_id: "node-a".to_owned(),
        deadletter_file: Some(deadletter_path.clone()),
        qos: QosConfig {
            reliable: ReliableConfig {
                ack_timeout_ms: 80,
                max_retries: 2,
                exponential_backoff: true,
            },
            ..QosConfig::default()
        },
        ..BusConfig::default()
    };
    let bus = Bus::new(cfg, transport, Arc::clone(&peers));
    bus.start();

    // The "peer" records everything and never acks.
    let sink = CaptureSocket::start(CaptureMode::Silent).await;
    peers.upsert(PeerRecord {
        node_id: "node-b".to_owned(),
        topics: vec!["t1".to_owned()],
        protocol_version: "1.0".to_owned(),
        last_seen: 0,
        host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        formats: vec!["json".to_owned()],
        data_port: sink.port(),
        stream_port: None,
    });

    let started = Instant::now();
    let mid = bus
        .publish("t1", object(json!({"v": 1})), Qos::Reliable)
        .await;

    // Initial send plus exactly two resends.
    assert!(
        wait_for(Duration::from_secs(2), || sink.received_count() == 3).await,
        "expected 3 wire sends, got {}",
        sink.received_count()
    );
    // Backoff gaps: ~80 ms then ~160 ms before the final resend.
    assert!(
        started.elapsed() >= Duration::from_millis(220),
        "third send arrived too early: {:?}",
        started.elapsed()
    );
    for envelope in sink.received_envelopes() {
        assert_eq!(envelope.message_id, mid);
        assert_eq!(envelope.topic, "t1");
    }

    // Exhaustion: one dead letter, pending drained.
    assert!(
        wait_for(Duration::from_secs(2), || !bus.dead_letters().is_empty()).await,
        "entry never dead-lettered"
    );
    let letters = bus.dead_letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].message_id, mid);
    assert_eq!(letters[0].receiver_id, "node-b");
    assert_eq!(bus.pending_len(), 0);

    // No further wire traffic after exhaustion.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(sink.received_count(), 3);

    // One persistent NDJSON record.
    let contents = std::fs::read_to_string(&deadletter_path).unwrap();
    assert_eq!(contents.lines().count(), 1);
    let line: serde_json::Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
    assert_eq!(line["message_id"], mid);
    assert_eq!(line["receiver"], "node-b");
    assert_eq!(line["attempts"], 2);
    assert_eq!(line["reason"], "max_retries_exceeded");

    bus.shutdown(50).await;
}

#[tokio::test]
async fn late_ack_after_eviction_is_inert() {
    let transport = Arc::new(UdpTransport::bind(0).await.unwrap());
    let bus_port = transport.bound_port();
    let peers = Arc::new(PeerTable::new());
    let cfg = BusConfig {
        node_id: "node-a".to_owned(),
        qos: QosConfig {
            reliable: ReliableConfig {
                ack_timeout_ms: 40,
                max_retries: 0,
                exponential_backoff: false,
            },
            ..QosConfig::default()
        },
        ..BusConfig::default()
    };
    let bus = Bus::new(cfg, transport, Arc::clone(&peers));
    bus.start();

    let sink = CaptureSocket::start(CaptureMode::Silent).await;
    peers.upsert(PeerRecord {
        node_id: "node-b".to_owned(),
        topics: vec!["t1".to_owned()],
        protocol_version: "1.0".to_owned(),
        last_seen: 0,
        host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        formats: vec!["json".to_owned()],
        data_port: sink.port(),
        stream_port: None,
    });

    let mid = bus.publish("t1", object(json!({})), Qos::Reliable).await;
    assert!(
        wait_for(Duration::from_secs(2), || !bus.dead_letters().is_empty()).await,
        "zero-retry entry must dead-letter quickly"
    );

    // The entry is gone; a straggler ack over the wire changes nothing.
    let ack = lb_codec::encode_packet(
        &lb_codec::Packet::Ack(lb_codec::AckPacket {
            message_id: mid,
            receiver_node_id: "node-b".to_owned(),
            status: "ACK".to_owned(),
            timestamp: 0,
        }),
        lb_codec::WireFormat::Json,
    )
    .unwrap();
    let straggler = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    straggler
        .send_to(&ack, ("127.0.0.1", bus_port))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(bus.ack_count(), 0);
    assert_eq!(bus.pending_len(), 0);

    bus.shutdown(50).await;
}
