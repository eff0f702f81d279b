// lb-test-utils: Shared helpers for the integration suites.
//
// Provides a scripted UDP endpoint standing in for a remote bus node (silent
// or auto-acking) plus small builders and polling helpers.

use lb_codec::{AckPacket, MessageEnvelope, Packet, WireFormat, decode_packet, encode_packet};
use serde_json::{Map, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep};

/// How a [`CaptureSocket`] reacts to inbound data packets.
#[derive(Debug, Clone)]
pub enum CaptureMode {
    /// Record and never respond — retry/dead-letter rigs.
    Silent,
    /// Record and reply with a JSON ACK under the given node id.
    AutoAck(String),
}

/// A scripted UDP endpoint that records every datagram it receives.
pub struct CaptureSocket {
    port: u16,
    received: Arc<Mutex<Vec<(Vec<u8>, SocketAddr)>>>,
    task: JoinHandle<()>,
}

impl CaptureSocket {
    pub async fn start(mode: CaptureMode) -> CaptureSocket {
        let sock = UdpSocket::bind("127.0.0.1:0")
            .await
            .expect("capture socket bind");
        let port = sock.local_addr().expect("local addr").port();
        let received: Arc<Mutex<Vec<(Vec<u8>, SocketAddr)>>> = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&received);
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let Ok((n, from)) = sock.recv_from(&mut buf).await else {
                    return;
                };
                let bytes = buf[..n].to_vec();
                log.lock().unwrap().push((bytes.clone(), from));

                if let CaptureMode::AutoAck(node_id) = &mode {
                    if let Ok(Packet::Data(envelope)) = decode_packet(&bytes) {
                        let ack = Packet::Ack(AckPacket {
                            message_id: envelope.message_id,
                            receiver_node_id: node_id.clone(),
                            status: "ACK".to_owned(),
                            timestamp: chrono::Utc::now().timestamp(),
                        });
                        let reply = encode_packet(&ack, WireFormat::Json).expect("ack encode");
                        let _ = sock.send_to(&reply, from).await;
                    }
                }
            }
        });

        CaptureSocket {
            port,
            received,
            task,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Snapshot of everything received so far.
    pub fn received(&self) -> Vec<(Vec<u8>, SocketAddr)> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_count(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    /// Decoded data packets among the received datagrams.
    pub fn received_envelopes(&self) -> Vec<MessageEnvelope> {
        self.received()
            .into_iter()
            .filter_map(|(bytes, _)| match decode_packet(&bytes) {
                Ok(Packet::Data(envelope)) => Some(envelope),
                _ => None,
            })
            .collect()
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for CaptureSocket {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Build a JSON object payload from a `serde_json::json!` value.
pub fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {:?}", other),
    }
}

/// Build a wire-ready data packet.
pub fn data_packet(
    topic: &str,
    message_id: i64,
    publisher_id: &str,
    qos: &str,
    payload: Map<String, Value>,
    format: WireFormat,
) -> Vec<u8> {
    let packet = Packet::Data(MessageEnvelope {
        topic: topic.to_owned(),
        message_id,
        timestamp: chrono::Utc::now().timestamp(),
        payload,
        publisher_id: publisher_id.to_owned(),
        qos: qos.to_owned(),
    });
    encode_packet(&packet, format).expect("data packet encode")
}

/// Poll `predicate` every 10 ms until it holds or `deadline` elapses.
/// Returns false on timeout.
pub async fn wait_for<F>(deadline: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> bool,
{
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if predicate() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    predicate()
}
