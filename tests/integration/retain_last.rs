//! Retain-last: a late subscriber still gets the newest value.

use lb_codec::Qos;
use lb_core::{Bus, BusConfig, PeerTable, QosConfig, UdpTransport};
use lb_test_utils::{object, wait_for};
use serde_json::json;
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

async fn retaining_bus(node_id: &str) -> (Arc<Bus>, u16) {
    let transport = Arc::new(UdpTransport::bind(0).await.unwrap());
    let port = transport.bound_port();
    let cfg = BusConfig {
        node_id: node_id.to_owned(),
        qos: QosConfig {
            retain_last: true,
            ..QosConfig::default()
        },
        ..BusConfig::default()
    };
    let bus = Bus::new(cfg, transport, Arc::new(PeerTable::new()));
    bus.start();
    (bus, port)
}

#[tokio::test]
async fn late_subscriber_gets_the_retained_envelope() {
    let (bus, _) = retaining_bus("node-a").await;

    let mid = bus
        .publish("t2", object(json!({"x": 42})), Qos::BestEffort)
        .await;

    // Subscribe well after the publish; delivery is immediate and
    // synchronous.
    let deliveries = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&deliveries);
    bus.subscribe("t2", move |enriched| {
        sink.lock().unwrap().push(enriched.clone());
    });

    let seen = deliveries.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0]["x"], 42);
    assert_eq!(seen[0]["topic"], "t2");
    assert_eq!(seen[0]["message_id"], mid);
    drop(seen);

    bus.shutdown(50).await;
}

#[tokio::test]
async fn only_the_newest_envelope_is_retained() {
    let (bus, _) = retaining_bus("node-a").await;

    bus.publish("t2", object(json!({"x": 1})), Qos::BestEffort)
        .await;
    bus.publish("t2", object(json!({"x": 2})), Qos::BestEffort)
        .await;
    let last = bus
        .publish("t2", object(json!({"x": 3})), Qos::BestEffort)
        .await;

    let deliveries = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&deliveries);
    bus.subscribe("t2", move |enriched| {
        sink.lock().unwrap().push(enriched.clone());
    });

    let seen = deliveries.lock().unwrap();
    assert_eq!(seen.len(), 1, "exactly one retained value per topic");
    assert_eq!(seen[0]["x"], 3);
    assert_eq!(seen[0]["message_id"], last);
    drop(seen);

    bus.shutdown(50).await;
}

#[tokio::test]
async fn remotely_published_envelope_reaches_a_late_local_subscriber() {
    let (bus, port) = retaining_bus("node-b").await;

    // A remote publisher's envelope arrives over the wire.
    let packet = lb_test_utils::data_packet(
        "t7",
        5,
        "node-remote",
        "best_effort",
        object(json!({"remote": 1})),
        lb_codec::WireFormat::Json,
    );
    let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sender.send_to(&packet, ("127.0.0.1", port)).await.unwrap();

    // No subscriber yet; wait until the envelope has been ingested.
    let probe = Arc::clone(&bus);
    assert!(
        wait_for(Duration::from_secs(2), move || {
            let hit = Arc::new(Mutex::new(false));
            let flag = Arc::clone(&hit);
            probe.subscribe("t7", move |_| *flag.lock().unwrap() = true);
            let delivered = *hit.lock().unwrap();
            delivered
        })
        .await,
        "retained remote envelope never delivered"
    );

    bus.shutdown(50).await;
}
