//! Dedup under duplicate delivery: a replayed datagram fires the subscriber
//! callback exactly once, and only the first copy is acknowledged.

use lb_codec::{Packet, WireFormat, decode_packet};
use lb_core::{Bus, BusConfig, PeerTable, UdpTransport};
use lb_test_utils::{data_packet, object, wait_for};
use serde_json::json;
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

#[tokio::test]
async fn replayed_datagram_delivers_once() {
    let transport = Arc::new(UdpTransport::bind(0).await.unwrap());
    let port = transport.bound_port();
    let cfg = BusConfig {
        node_id: "node-b".to_owned(),
        ..BusConfig::default()
    };
    let bus = Bus::new(cfg, transport, Arc::new(PeerTable::new()));
    bus.start();

    let deliveries = Arc::new(Mutex::new(0usize));
    let sink = Arc::clone(&deliveries);
    bus.subscribe("t1", move |_| *sink.lock().unwrap() += 1);

    // The same encoded reliable data packet, three times over.
    let packet = data_packet(
        "t1",
        9,
        "node-remote",
        "reliable",
        object(json!({"v": 9})),
        WireFormat::Json,
    );
    let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for _ in 0..3 {
        sender.send_to(&packet, ("127.0.0.1", port)).await.unwrap();
    }

    assert!(
        wait_for(Duration::from_secs(2), || *deliveries.lock().unwrap() >= 1).await,
        "first copy never delivered"
    );
    // Give the replays time to land, then confirm no extra deliveries.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(*deliveries.lock().unwrap(), 1);

    // Only the first (fresh) copy produced an ack back to the sender.
    let mut buf = vec![0u8; 2048];
    let mut acks = 0;
    while let Ok(Ok((n, _))) = tokio::time::timeout(
        Duration::from_millis(200),
        sender.recv_from(&mut buf),
    )
    .await
    {
        if let Ok(Packet::Ack(ack)) = decode_packet(&buf[..n]) {
            assert_eq!(ack.message_id, 9);
            assert_eq!(ack.receiver_node_id, "node-b");
            acks += 1;
        }
    }
    assert_eq!(acks, 1, "duplicates must not be re-acknowledged");

    bus.shutdown(50).await;
}

#[tokio::test]
async fn replay_in_a_different_codec_is_still_a_duplicate() {
    let transport = Arc::new(UdpTransport::bind(0).await.unwrap());
    let port = transport.bound_port();
    let cfg = BusConfig {
        node_id: "node-b".to_owned(),
        ..BusConfig::default()
    };
    let bus = Bus::new(cfg, transport, Arc::new(PeerTable::new()));
    bus.start();

    let deliveries = Arc::new(Mutex::new(0usize));
    let sink = Arc::clone(&deliveries);
    bus.subscribe("t1", move |_| *sink.lock().unwrap() += 1);

    // Dedup is keyed by identity, not by encoding.
    let json_copy = data_packet(
        "t1",
        4,
        "node-remote",
        "best_effort",
        object(json!({"v": 4})),
        WireFormat::Json,
    );
    let cbor_copy = data_packet(
        "t1",
        4,
        "node-remote",
        "best_effort",
        object(json!({"v": 4})),
        WireFormat::Cbor,
    );
    let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sender.send_to(&json_copy, ("127.0.0.1", port)).await.unwrap();
    sender.send_to(&cbor_copy, ("127.0.0.1", port)).await.unwrap();

    assert!(wait_for(Duration::from_secs(2), || *deliveries.lock().unwrap() >= 1).await);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(*deliveries.lock().unwrap(), 1);

    bus.shutdown(50).await;
}
