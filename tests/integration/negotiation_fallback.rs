//! Format negotiation at the publish path.
//!
//! A peer that only advertises `cbor` while we only support `json`: with the
//! JSON fallback allowed the publish goes out as JSON and round-trips; with
//! the fallback disabled the destination is skipped entirely.

use lb_codec::Qos;
use lb_core::{
    Bus, BusConfig, PeerRecord, PeerTable, SerializationConfig, UdpTransport,
};
use lb_test_utils::{CaptureMode, CaptureSocket, object, wait_for};
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::time::Duration;

fn cbor_only_peer(data_port: u16) -> PeerRecord {
    PeerRecord {
        node_id: "node-b".to_owned(),
        topics: vec!["t1".to_owned()],
        protocol_version: "1.0".to_owned(),
        last_seen: 0,
        host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        formats: vec!["cbor".to_owned()],
        data_port,
        stream_port: None,
    }
}

async fn json_only_bus(allow_json_fallback: bool, peers: Arc<PeerTable>) -> Arc<Bus> {
    let transport = Arc::new(UdpTransport::bind(0).await.unwrap());
    let cfg = BusConfig {
        node_id: "node-a".to_owned(),
        serialization: SerializationConfig {
            format: "json".to_owned(),
            supported: vec!["json".to_owned()],
            allow_json_fallback,
        },
        ..BusConfig::default()
    };
    let bus = Bus::new(cfg, transport, peers);
    bus.start();
    bus
}

#[tokio::test]
async fn disjoint_preferences_fall_back_to_json() {
    let peers = Arc::new(PeerTable::new());
    let bus = json_only_bus(true, Arc::clone(&peers)).await;

    let sink = CaptureSocket::start(CaptureMode::AutoAck("node-b".to_owned())).await;
    peers.upsert(cbor_only_peer(sink.port()));

    let mid = bus
        .publish("t1", object(json!({"v": 5})), Qos::Reliable)
        .await;

    assert!(
        wait_for(Duration::from_secs(2), || sink.received_count() >= 1).await,
        "peer never received the publish"
    );

    // The wire bytes are JSON despite the peer's cbor-only advertisement.
    let (bytes, _) = sink.received()[0].clone();
    let decoded: serde_json::Value =
        serde_json::from_slice(&bytes).expect("fallback publish must be plain JSON");
    assert_eq!(decoded["type"], "data");
    assert_eq!(decoded["message_id"], mid);

    // The auto-ack round-trips and drains the pending entry.
    assert!(wait_for(Duration::from_secs(2), || bus.pending_len() == 0).await);
    assert!(bus.dead_letters().is_empty());

    bus.shutdown(50).await;
}

#[tokio::test]
async fn disjoint_preferences_without_fallback_skip_the_peer() {
    let peers = Arc::new(PeerTable::new());
    let bus = json_only_bus(false, Arc::clone(&peers)).await;

    let sink = CaptureSocket::start(CaptureMode::AutoAck("node-b".to_owned())).await;
    peers.upsert(cbor_only_peer(sink.port()));

    bus.publish("t1", object(json!({"v": 5})), Qos::Reliable)
        .await;

    // Nothing tracked, nothing sent.
    assert_eq!(bus.pending_len(), 0);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(sink.received_count(), 0);

    bus.shutdown(50).await;
}

#[tokio::test]
async fn mutual_preference_wins_over_fallback() {
    let transport = Arc::new(UdpTransport::bind(0).await.unwrap());
    let peers = Arc::new(PeerTable::new());
    let cfg = BusConfig {
        node_id: "node-a".to_owned(),
        serialization: SerializationConfig {
            format: "json".to_owned(),
            supported: vec!["cbor".to_owned(), "json".to_owned()],
            allow_json_fallback: true,
        },
        ..BusConfig::default()
    };
    let bus = Bus::new(cfg, transport, Arc::clone(&peers));
    bus.start();

    let sink = CaptureSocket::start(CaptureMode::AutoAck("node-b".to_owned())).await;
    peers.upsert(cbor_only_peer(sink.port()));

    bus.publish("t1", object(json!({"v": 6})), Qos::Reliable)
        .await;
    assert!(wait_for(Duration::from_secs(2), || sink.received_count() >= 1).await);

    // cbor is the first mutual preference, so the bytes must not be JSON.
    let (bytes, _) = sink.received()[0].clone();
    assert!(serde_json::from_slice::<serde_json::Value>(&bytes).is_err());
    assert_eq!(sink.received_envelopes().len(), 1);

    bus.shutdown(50).await;
}
