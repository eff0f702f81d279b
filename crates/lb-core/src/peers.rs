//! Peer membership table.
//!
//! The table is the sole owner of [`PeerRecord`]s: discovery ingest upserts,
//! the expiry tick removes, and everything else reads value snapshots under
//! a single-writer lock. Routing never sees a record without a usable data
//! port.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

/// Membership entry for one remote node.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRecord {
    pub node_id: String,
    /// Topics the peer advertised interest in.
    pub topics: Vec<String>,
    pub protocol_version: String,
    /// Unix seconds of the latest announcement.
    pub last_seen: i64,
    /// Discovered from the announcement's datagram origin.
    pub host: IpAddr,
    /// Codec preference order as advertised; empty means unknown.
    pub formats: Vec<String>,
    pub data_port: u16,
    pub stream_port: Option<u16>,
}

#[derive(Debug, Default)]
pub struct PeerTable {
    inner: Mutex<HashMap<String, PeerRecord>>,
}

impl PeerTable {
    pub fn new() -> PeerTable {
        PeerTable::default()
    }

    /// Insert or refresh a peer. The only write path besides expiry.
    pub fn upsert(&self, record: PeerRecord) {
        self.lock().insert(record.node_id.clone(), record);
    }

    pub fn list(&self) -> Vec<PeerRecord> {
        self.lock().values().cloned().collect()
    }

    pub fn get(&self, node_id: &str) -> Option<PeerRecord> {
        self.lock().get(node_id).cloned()
    }

    pub fn has(&self, node_id: &str) -> bool {
        self.lock().contains_key(node_id)
    }

    pub fn topics_for(&self, node_id: &str) -> Vec<String> {
        self.lock()
            .get(node_id)
            .map(|p| p.topics.clone())
            .unwrap_or_default()
    }

    pub fn formats_for(&self, node_id: &str) -> Vec<String> {
        self.lock()
            .get(node_id)
            .map(|p| p.formats.clone())
            .unwrap_or_default()
    }

    /// Peers advertising `topic`. Records with a zero data port are not
    /// routable and are excluded here.
    pub fn peers_for_topic(&self, topic: &str) -> Vec<PeerRecord> {
        self.lock()
            .values()
            .filter(|p| p.data_port != 0 && p.topics.iter().any(|t| t == topic))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Remove peers that have been silent for longer than `ttl_secs`.
    /// Returns the removed node ids.
    pub fn expire_older_than(&self, now_secs: i64, ttl_secs: i64) -> Vec<String> {
        let mut table = self.lock();
        let expired: Vec<String> = table
            .values()
            .filter(|p| now_secs - p.last_seen > ttl_secs)
            .map(|p| p.node_id.clone())
            .collect();
        for id in &expired {
            table.remove(id);
        }
        expired
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PeerRecord>> {
        self.inner.lock().expect("peer table lock poisoned")
    }
}
