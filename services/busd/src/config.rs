//! Node configuration loading.
//!
//! TOML is the sole config source. Every option has a default, so an empty
//! file (or none of the sections) yields a runnable node with a generated
//! identity. Out-of-range values are coerced to safe defaults with a warn
//! log rather than refusing to start.
//!
//! Hot reload: only `logging.level` and `discovery.interval_ms` apply at
//! runtime. [`reload_diff`] compares two loaded configs and produces one
//! warning per changed key that needs a restart.

use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::warn;

// ---------------------------------------------------------------------------
// Validated config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub node_id: String,
    pub protocol_version: String,
    pub discovery: DiscoverySection,
    pub transport: TransportSection,
    pub qos: QosSection,
    pub serialization: SerializationSection,
    pub logging: LoggingSection,
    /// Topics this node advertises in its announcements.
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoverySection {
    pub enabled: bool,
    /// "broadcast" or "multicast".
    pub mode: String,
    pub address: Ipv4Addr,
    pub port: u16,
    pub interval_ms: u64,
    /// Multicast TTL.
    pub ttl: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportSection {
    pub udp: UdpSection,
    pub tcp: TcpSection,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UdpSection {
    pub port: u16,
    pub rcvbuf: u32,
    pub sndbuf: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TcpSection {
    pub listen: bool,
    pub port: u16,
    /// Outbound `(host, port)` pairs.
    pub connect: Vec<(String, u16)>,
    pub rcvbuf: u32,
    pub sndbuf: u32,
    pub connect_timeout_ms: u64,
    pub heartbeat_ms: u64,
    pub reconnect_backoff_ms: u64,
    pub max_reconnect_attempts: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QosSection {
    /// "best_effort" or "reliable".
    pub default_qos: String,
    pub ack_timeout_ms: u64,
    pub max_retries: u32,
    pub exponential_backoff: bool,
    pub dedup_capacity: usize,
    pub retain_last: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SerializationSection {
    pub format: String,
    /// Preference order; defaults to `[format, <the other one>]`.
    pub supported: Vec<String>,
    pub allow_json_fallback: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoggingSection {
    pub level: String,
    pub file: Option<String>,
    pub deadletter_file: String,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    node_id: Option<String>,
    protocol_version: Option<String>,
    discovery: Option<RawDiscovery>,
    transport: Option<RawTransport>,
    qos: Option<RawQos>,
    serialization: Option<RawSerialization>,
    logging: Option<RawLogging>,
    topics: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDiscovery {
    enabled: Option<bool>,
    mode: Option<String>,
    address: Option<String>,
    port: Option<u16>,
    interval_ms: Option<u64>,
    ttl: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTransport {
    udp: Option<RawUdp>,
    tcp: Option<RawTcp>,
}

#[derive(Debug, Default, Deserialize)]
struct RawUdp {
    port: Option<u16>,
    rcvbuf: Option<u32>,
    sndbuf: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTcp {
    listen: Option<bool>,
    port: Option<u16>,
    connect: Option<Vec<String>>,
    rcvbuf: Option<u32>,
    sndbuf: Option<u32>,
    connect_timeout_ms: Option<u64>,
    heartbeat_ms: Option<u64>,
    reconnect_backoff_ms: Option<u64>,
    max_reconnect_attempts: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct RawQos {
    default: Option<String>,
    reliable: Option<RawReliable>,
    dedup_capacity: Option<usize>,
    retain_last: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawReliable {
    ack_timeout_ms: Option<u64>,
    max_retries: Option<u32>,
    exponential_backoff: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSerialization {
    format: Option<String>,
    supported: Option<Vec<String>>,
    allow_json_fallback: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawLogging {
    level: Option<String>,
    file: Option<String>,
    deadletter_file: Option<String>,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {}", s),
            ConfigError::Parse(s) => write!(f, "Parse error: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from `path`.
pub fn load_config_from_path(path: &Path) -> Result<Config, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load config from a TOML string, applying defaults and coercions.
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let node_id = raw
        .node_id
        .unwrap_or_else(|| format!("node-{}", &uuid::Uuid::new_v4().to_string()[..8]));
    let protocol_version = raw.protocol_version.unwrap_or_else(|| "1.0".to_owned());

    let discovery = validate_discovery(raw.discovery.unwrap_or_default());
    let transport = validate_transport(raw.transport.unwrap_or_default());
    let qos = validate_qos(raw.qos.unwrap_or_default());
    let serialization = validate_serialization(raw.serialization.unwrap_or_default());

    let logging = {
        let l = raw.logging.unwrap_or_default();
        LoggingSection {
            level: l.level.unwrap_or_else(|| "info".to_owned()),
            file: l.file,
            deadletter_file: l
                .deadletter_file
                .unwrap_or_else(|| "logs/deadletter.ndjson".to_owned()),
        }
    };

    Ok(Config {
        node_id,
        protocol_version,
        discovery,
        transport,
        qos,
        serialization,
        logging,
        topics: raw.topics.unwrap_or_default(),
    })
}

// ---------------------------------------------------------------------------
// Section validation
// ---------------------------------------------------------------------------

fn validate_discovery(raw: RawDiscovery) -> DiscoverySection {
    let mut mode = raw.mode.unwrap_or_else(|| "broadcast".to_owned());
    if mode != "broadcast" && mode != "multicast" {
        warn!(got = %mode, "discovery.mode must be 'broadcast' or 'multicast'");
        mode = "broadcast".to_owned();
    }

    let mut port = raw.port.unwrap_or(39001);
    if port < 1024 {
        warn!(got = port, "discovery.port out of range (1024-65535)");
        port = 39001;
    }

    let mut interval_ms = raw.interval_ms.unwrap_or(1000);
    if interval_ms < 200 {
        warn!(got = interval_ms, "discovery.interval_ms too low, clamping to 200");
        interval_ms = 200;
    }

    let mut address = raw
        .address
        .as_deref()
        .and_then(|a| a.parse::<Ipv4Addr>().ok())
        .unwrap_or_else(|| Ipv4Addr::new(239, 255, 0, 1));
    if mode == "multicast" && !address.is_multicast() {
        warn!(got = %address, "discovery.address is not an IPv4 multicast address");
        address = Ipv4Addr::new(239, 255, 0, 1);
    }

    DiscoverySection {
        enabled: raw.enabled.unwrap_or(true),
        mode,
        address,
        port,
        interval_ms,
        ttl: raw.ttl.unwrap_or(1),
    }
}

fn validate_transport(raw: RawTransport) -> TransportSection {
    let udp = {
        let u = raw.udp.unwrap_or_default();
        UdpSection {
            port: u.port.unwrap_or(39000),
            rcvbuf: u.rcvbuf.unwrap_or(262_144),
            sndbuf: u.sndbuf.unwrap_or(262_144),
        }
    };

    let tcp = {
        let t = raw.tcp.unwrap_or_default();
        let mut connect = Vec::new();
        for entry in t.connect.unwrap_or_default() {
            match parse_host_port(&entry) {
                Some(pair) => connect.push(pair),
                None => warn!(got = %entry, "transport.tcp.connect entry is not HOST:PORT, skipping"),
            }
        }
        TcpSection {
            listen: t.listen.unwrap_or(false),
            port: t.port.unwrap_or(39100),
            connect,
            rcvbuf: t.rcvbuf.unwrap_or(262_144),
            sndbuf: t.sndbuf.unwrap_or(262_144),
            connect_timeout_ms: t.connect_timeout_ms.unwrap_or(3000),
            heartbeat_ms: t.heartbeat_ms.unwrap_or(5000),
            reconnect_backoff_ms: t.reconnect_backoff_ms.unwrap_or(1000),
            max_reconnect_attempts: t.max_reconnect_attempts.unwrap_or(5),
        }
    };

    TransportSection { udp, tcp }
}

fn validate_qos(raw: RawQos) -> QosSection {
    let mut default_qos = raw.default.unwrap_or_else(|| "best_effort".to_owned());
    if default_qos.parse::<lb_codec::Qos>().is_err() {
        warn!(got = %default_qos, "qos.default must be 'best_effort' or 'reliable'");
        default_qos = "best_effort".to_owned();
    }
    let reliable = raw.reliable.unwrap_or_default();
    QosSection {
        default_qos,
        ack_timeout_ms: reliable.ack_timeout_ms.unwrap_or(300),
        max_retries: reliable.max_retries.unwrap_or(3),
        exponential_backoff: reliable.exponential_backoff.unwrap_or(true),
        dedup_capacity: raw.dedup_capacity.unwrap_or(1024),
        retain_last: raw.retain_last.unwrap_or(false),
    }
}

fn validate_serialization(raw: RawSerialization) -> SerializationSection {
    let format = raw.format.unwrap_or_else(|| "json".to_owned());
    let supported = match raw.supported {
        Some(list) if !list.is_empty() => list,
        _ => {
            // Our format first, then the other one.
            let other = if format == "json" { "cbor" } else { "json" };
            vec![format.clone(), other.to_owned()]
        }
    };
    SerializationSection {
        format,
        supported,
        allow_json_fallback: raw.allow_json_fallback.unwrap_or(true),
    }
}

/// Parse `HOST:PORT`, splitting on the last colon.
fn parse_host_port(s: &str) -> Option<(String, u16)> {
    let colon = s.rfind(':')?;
    let host = &s[..colon];
    let port: u16 = s[colon + 1..].parse().ok()?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_owned(), port))
}

// ---------------------------------------------------------------------------
// Hot reload
// ---------------------------------------------------------------------------

/// What a config reload may actually apply.
#[derive(Debug, Default, PartialEq)]
pub struct ReloadPlan {
    /// One entry per changed key that requires a restart.
    pub warnings: Vec<String>,
    pub log_level: Option<String>,
    pub discovery_interval_ms: Option<u64>,
}

/// Compare two loaded configs. Reloadable keys land in the plan's fields;
/// every other change produces a warning naming the key.
pub fn reload_diff(old: &Config, new: &Config) -> ReloadPlan {
    let mut plan = ReloadPlan::default();

    let mut restart = |key: &str| {
        plan.warnings
            .push(format!("{} changed but is not reloadable; restart required", key));
    };

    if new.node_id != old.node_id {
        restart("node_id");
    }
    if new.protocol_version != old.protocol_version {
        restart("protocol_version");
    }
    if new.discovery.enabled != old.discovery.enabled {
        restart("discovery.enabled");
    }
    if new.discovery.mode != old.discovery.mode {
        restart("discovery.mode");
    }
    if new.discovery.address != old.discovery.address {
        restart("discovery.address");
    }
    if new.discovery.port != old.discovery.port {
        restart("discovery.port");
    }
    if new.discovery.ttl != old.discovery.ttl {
        restart("discovery.ttl");
    }
    if new.transport.udp != old.transport.udp {
        restart("transport.udp");
    }
    if new.transport.tcp != old.transport.tcp {
        restart("transport.tcp");
    }
    if new.qos != old.qos {
        restart("qos");
    }
    if new.serialization != old.serialization {
        restart("serialization");
    }
    if new.topics != old.topics {
        restart("topics");
    }
    if new.logging.file != old.logging.file {
        restart("logging.file");
    }
    if new.logging.deadletter_file != old.logging.deadletter_file {
        restart("logging.deadletter_file");
    }

    if new.logging.level != old.logging.level {
        plan.log_level = Some(new.logging.level.clone());
    }
    if new.discovery.interval_ms != old.discovery.interval_ms {
        plan.discovery_interval_ms = Some(new.discovery.interval_ms);
    }

    plan
}
