// lb-codec: Wire packet types and serialization for the LAN bus.
//
// All packets carry a top-level `type` field for discriminated
// deserialization. Two codecs are supported and both produce
// self-describing output: compact JSON and CBOR maps with string keys.
// Inbound bytes are auto-detected (CBOR attempted first, JSON fallback).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod frame;

// ---------------------------------------------------------------------------
// QoS
// ---------------------------------------------------------------------------

/// Quality-of-service level for a publication.
///
/// On the wire `qos` travels as a plain string so that peers with unknown
/// spellings still decode; [`is_reliable`] does the canonical check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    BestEffort,
    Reliable,
}

impl Qos {
    pub fn as_str(self) -> &'static str {
        match self {
            Qos::BestEffort => "best_effort",
            Qos::Reliable => "reliable",
        }
    }
}

impl std::fmt::Display for Qos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Qos {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("reliable") {
            Ok(Qos::Reliable)
        } else if s.eq_ignore_ascii_case("best_effort") || s.eq_ignore_ascii_case("best-effort") {
            Ok(Qos::BestEffort)
        } else {
            Err(format!("unknown qos level: '{}'", s))
        }
    }
}

/// Case-insensitive check for the reliable QoS wire string.
pub fn is_reliable(qos: &str) -> bool {
    qos.eq_ignore_ascii_case("reliable")
}

// ---------------------------------------------------------------------------
// Wire formats
// ---------------------------------------------------------------------------

/// A concrete encoding a packet can travel in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireFormat {
    Json,
    Cbor,
}

impl WireFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            WireFormat::Json => "json",
            WireFormat::Cbor => "cbor",
        }
    }

    pub fn parse(s: &str) -> Option<WireFormat> {
        if s.eq_ignore_ascii_case("json") {
            Some(WireFormat::Json)
        } else if s.eq_ignore_ascii_case("cbor") {
            Some(WireFormat::Cbor)
        } else {
            None
        }
    }
}

impl std::fmt::Display for WireFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Packet kinds
// ---------------------------------------------------------------------------

/// A published message as it travels between nodes.
///
/// Immutable once created. The same envelope may be encoded more than once
/// under different codecs when fanning out to heterogeneous peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub topic: String,
    /// Monotonic per publisher.
    pub message_id: i64,
    /// Unix seconds; informational, not required on decode.
    #[serde(default)]
    pub timestamp: i64,
    pub payload: Map<String, Value>,
    pub publisher_id: String,
    /// Wire string; see [`is_reliable`].
    pub qos: String,
}

/// Acknowledgement for a reliable data packet.
///
/// Inbound packets may name the receiver under legacy field names
/// (`receiverId`, `receiver`, `to`); they are normalized here so the engine
/// only ever sees `receiver_node_id`. Re-emitted canonically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckPacket {
    pub message_id: i64,
    #[serde(default, alias = "receiverId", alias = "receiver", alias = "to")]
    pub receiver_node_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub timestamp: i64,
}

/// Periodic membership announcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryPacket {
    pub node_id: String,
    pub topics: Vec<String>,
    #[serde(default)]
    pub protocol_version: String,
    #[serde(default)]
    pub timestamp: i64,
    /// Port the announcing node receives data packets on.
    pub data_port: u16,
    /// Codec preference order; empty means unknown.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub serialization: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_port: Option<u16>,
}

/// All packet kinds, discriminated by the `type` field.
///
/// ```json
/// { "type": "data", "topic": "t1", ... }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Packet {
    Discovery(DiscoveryPacket),
    Data(MessageEnvelope),
    Ack(AckPacket),
}

impl Packet {
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Discovery(_) => "discovery",
            Packet::Data(_) => "data",
            Packet::Ack(_) => "ack",
        }
    }
}

// ---------------------------------------------------------------------------
// Encode / decode
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum CodecError {
    Empty,
    NotAMap,
    MissingType,
    Json(String),
    Cbor(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Empty => write!(f, "empty input"),
            CodecError::NotAMap => write!(f, "root is not a map"),
            CodecError::MissingType => write!(f, "missing 'type' discriminator"),
            CodecError::Json(s) => write!(f, "JSON codec error: {}", s),
            CodecError::Cbor(s) => write!(f, "CBOR codec error: {}", s),
        }
    }
}

impl std::error::Error for CodecError {}

/// Encode a packet in the given wire format. JSON output is compact.
pub fn encode_packet(packet: &Packet, format: WireFormat) -> Result<Vec<u8>, CodecError> {
    match format {
        WireFormat::Json => serde_json::to_vec(packet).map_err(|e| CodecError::Json(e.to_string())),
        WireFormat::Cbor => {
            let mut out = Vec::new();
            ciborium::ser::into_writer(packet, &mut out)
                .map_err(|e| CodecError::Cbor(e.to_string()))?;
            Ok(out)
        }
    }
}

/// Decode a packet with format auto-detection.
///
/// CBOR is attempted first and accepted only when the root parses as a map
/// carrying a `type` key; anything else falls back to JSON. Empty input,
/// non-map roots and a missing discriminator are decode failures, as is any
/// packet missing its kind's required fields.
pub fn decode_packet(bytes: &[u8]) -> Result<Packet, CodecError> {
    if bytes.is_empty() {
        return Err(CodecError::Empty);
    }

    if let Ok(value) = ciborium::de::from_reader::<ciborium::value::Value, _>(bytes) {
        if cbor_typed_map(&value) {
            return value
                .deserialized()
                .map_err(|e| CodecError::Cbor(e.to_string()));
        }
    }

    let value: Value = serde_json::from_slice(bytes).map_err(|e| CodecError::Json(e.to_string()))?;
    let Some(obj) = value.as_object() else {
        return Err(CodecError::NotAMap);
    };
    if !obj.contains_key("type") {
        return Err(CodecError::MissingType);
    }
    serde_json::from_value(value).map_err(|e| CodecError::Json(e.to_string()))
}

fn cbor_typed_map(value: &ciborium::value::Value) -> bool {
    match value {
        ciborium::value::Value::Map(entries) => entries
            .iter()
            .any(|(k, _)| matches!(k, ciborium::value::Value::Text(t) if t == "type")),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Format negotiation
// ---------------------------------------------------------------------------

/// Pick the first of our preferred formats that the peer also supports.
///
/// An empty peer list means the peer advertised nothing; our first preference
/// wins (JSON if we advertise nothing either). `None` means the preference
/// lists are disjoint — whether to fall back to JSON is the caller's policy.
pub fn negotiate_format(ours: &[String], peer: &[String]) -> Option<String> {
    if peer.is_empty() {
        return Some(ours.first().cloned().unwrap_or_else(|| "json".to_owned()));
    }
    ours.iter().find(|f| peer.contains(f)).cloned()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
