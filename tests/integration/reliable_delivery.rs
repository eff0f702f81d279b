//! Reliable delivery between two engines on loopback.
//!
//! Node B subscribes to `t1`; node A publishes reliable. B's callback must
//! fire exactly once with the enriched payload, A's pending entry must drain
//! on the ack, and no retransmit or dead-letter may occur.

use lb_codec::Qos;
use lb_core::{Bus, BusConfig, PeerRecord, PeerTable, UdpTransport};
use lb_test_utils::{object, wait_for};
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

async fn spawn_node(node_id: &str) -> (Arc<Bus>, Arc<PeerTable>, u16) {
    let transport = Arc::new(UdpTransport::bind(0).await.unwrap());
    let port = transport.bound_port();
    let peers = Arc::new(PeerTable::new());
    let cfg = BusConfig {
        node_id: node_id.to_owned(),
        ..BusConfig::default()
    };
    let bus = Bus::new(cfg, transport, Arc::clone(&peers));
    bus.start();
    (bus, peers, port)
}

fn loopback_peer(node_id: &str, topics: &[&str], data_port: u16) -> PeerRecord {
    PeerRecord {
        node_id: node_id.to_owned(),
        topics: topics.iter().map(|t| (*t).to_owned()).collect(),
        protocol_version: "1.0".to_owned(),
        last_seen: unix_now(),
        host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        formats: vec!["json".to_owned(), "cbor".to_owned()],
        data_port,
        stream_port: None,
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

#[tokio::test]
async fn reliable_publish_delivers_once_and_drains() {
    let (bus_a, peers_a, _port_a) = spawn_node("node-a").await;
    let (bus_b, _peers_b, port_b) = spawn_node("node-b").await;

    // Manual peer entry stands in for a completed discovery exchange.
    peers_a.upsert(loopback_peer("node-b", &["t1"], port_b));

    let deliveries = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&deliveries);
    bus_b.subscribe("t1", move |enriched| {
        sink.lock().unwrap().push(enriched.clone());
    });

    let mid = bus_a
        .publish("t1", object(json!({"v": 1})), Qos::Reliable)
        .await;
    assert_eq!(mid, 1);

    // Exactly one enriched delivery at B.
    assert!(
        wait_for(Duration::from_secs(2), || deliveries.lock().unwrap().len() == 1).await,
        "subscriber callback never fired"
    );
    {
        let seen = deliveries.lock().unwrap();
        assert_eq!(seen[0]["v"], 1);
        assert_eq!(seen[0]["topic"], "t1");
        assert_eq!(seen[0]["qos"], "reliable");
        assert_eq!(seen[0]["message_id"], 1);
    }

    // A's tracker drains once the ack lands; nothing dead-letters.
    assert!(
        wait_for(Duration::from_secs(2), || bus_a.pending_len() == 0).await,
        "pending entry never drained"
    );
    assert_eq!(bus_a.ack_count(), 1);
    assert!(bus_a.dead_letters().is_empty());

    // Past the ack window: still exactly one delivery, so no resend fired.
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(deliveries.lock().unwrap().len(), 1);

    bus_a.shutdown(100).await;
    bus_b.shutdown(100).await;
}

#[tokio::test]
async fn reliable_fan_out_reaches_every_subscribing_peer() {
    let (bus_a, peers_a, _) = spawn_node("node-a").await;
    let (bus_b, _, port_b) = spawn_node("node-b").await;
    let (bus_c, _, port_c) = spawn_node("node-c").await;

    peers_a.upsert(loopback_peer("node-b", &["t1"], port_b));
    peers_a.upsert(loopback_peer("node-c", &["t1"], port_c));

    let count_b = Arc::new(Mutex::new(0usize));
    let count_c = Arc::new(Mutex::new(0usize));
    let sink = Arc::clone(&count_b);
    bus_b.subscribe("t1", move |_| *sink.lock().unwrap() += 1);
    let sink = Arc::clone(&count_c);
    bus_c.subscribe("t1", move |_| *sink.lock().unwrap() += 1);

    bus_a
        .publish("t1", object(json!({"fan": "out"})), Qos::Reliable)
        .await;
    assert_eq!(bus_a.pending_len(), 2);

    assert!(
        wait_for(Duration::from_secs(2), || {
            *count_b.lock().unwrap() == 1 && *count_c.lock().unwrap() == 1
        })
        .await
    );
    assert!(wait_for(Duration::from_secs(2), || bus_a.pending_len() == 0).await);
    assert_eq!(bus_a.ack_count(), 2);

    bus_a.shutdown(100).await;
    bus_b.shutdown(100).await;
    bus_c.shutdown(100).await;
}
