//! Discovery lifecycle: mutual discovery within a few announce intervals,
//! then expiry of a node that stops announcing.

use lb_core::{Announcement, Discovery, DiscoveryConfig, PeerEvent, PeerTable};
use lb_test_utils::wait_for;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;

fn announcement(node_id: &str, topics: &[&str], data_port: u16) -> Announcement {
    Announcement {
        node_id: node_id.to_owned(),
        topics: topics.iter().map(|t| (*t).to_owned()).collect(),
        protocol_version: "1.0".to_owned(),
        formats: vec!["json".to_owned(), "cbor".to_owned()],
        data_port,
        stream_port: None,
    }
}

fn cfg(targets: Vec<u16>, interval_ms: u64, ttl_secs: i64) -> DiscoveryConfig {
    DiscoveryConfig {
        port: 0,
        interval: Duration::from_millis(interval_ms),
        peer_ttl_secs: ttl_secs,
        loopback_targets: targets,
        ..DiscoveryConfig::default()
    }
}

/// Reserve two distinct UDP ports and release them for the discovery binds.
/// `SO_REUSEADDR` on the discovery socket makes the re-bind race-free enough
/// for a loopback test rig.
async fn probe_ports() -> (u16, u16) {
    let a = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let b = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let pa = a.local_addr().unwrap().port();
    let pb = b.local_addr().unwrap().port();
    (pa, pb)
}

#[tokio::test]
async fn nodes_discover_each_other_and_expire_after_silence() {
    let (port_a, port_b) = probe_ports().await;

    let table_a = Arc::new(PeerTable::new());
    let table_b = Arc::new(PeerTable::new());
    let (events_a_tx, mut events_a) = mpsc::channel(64);

    let mut cfg_a = cfg(vec![port_b], 200, 1);
    cfg_a.port = port_a;
    let mut cfg_b = cfg(vec![port_a], 200, 1);
    cfg_b.port = port_b;

    let _a = Discovery::start(
        cfg_a,
        announcement("node-a", &["t1"], 4000),
        Arc::clone(&table_a),
        Some(events_a_tx),
    )
    .await
    .unwrap();
    let b = Discovery::start(
        cfg_b,
        announcement("node-b", &["t2"], 4001),
        Arc::clone(&table_b),
        None,
    )
    .await
    .unwrap();

    // Mutual discovery within ~3 announce intervals.
    assert!(
        wait_for(Duration::from_millis(800), || {
            table_a.has("node-b") && table_b.has("node-a")
        })
        .await,
        "nodes never discovered each other"
    );

    let b_record = table_a.get("node-b").unwrap();
    assert_eq!(b_record.data_port, 4001);
    assert_eq!(b_record.topics, vec!["t2".to_owned()]);

    let mut saw_update = false;
    while let Ok(event) = events_a.try_recv() {
        if matches!(&event, PeerEvent::Updated(r) if r.node_id == "node-b") {
            saw_update = true;
        }
    }
    assert!(saw_update, "peer-updated event never emitted");

    // Kill B. A must drop it within TTL + one announce interval.
    b.stop();
    assert!(
        wait_for(Duration::from_millis(2500), || !table_a.has("node-b")).await,
        "silent peer never expired"
    );

    // And the expiry is observable as an event.
    let expired = wait_for(Duration::from_millis(500), || {
        while let Ok(event) = events_a.try_recv() {
            if matches!(&event, PeerEvent::Expired(id) if id == "node-b") {
                return true;
            }
        }
        false
    })
    .await;
    assert!(expired, "expiry event never emitted");

    // A re-announcing B would come back as a brand-new record; until then
    // the table stays clean.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!table_a.has("node-b"));
}
