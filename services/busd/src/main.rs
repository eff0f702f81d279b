// busd: LAN bus node daemon and CLI front-end.
//
// Wires config, logging, transports, the bus engine and discovery together,
// then runs one of three roles: a publisher, a subscriber, or a plain node.

use busd::config::{self, Config};
use busd::logging;
use clap::{Arg, ArgAction, Command};
use lb_codec::Qos;
use lb_core::{
    Announcement, Bus, BusConfig, Discovery, DiscoveryConfig, DiscoveryMode, PeerTable, QosConfig,
    ReliableConfig, SerializationConfig, StreamConfig, StreamEvent, StreamTransport, UdpTransport,
};
use serde_json::{Map, Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep};
use tracing::{error, info, warn};

/// Budget for draining unacknowledged reliable sends on exit.
const SHUTDOWN_DRAIN_MS: u64 = 1000;

// ---------------------------------------------------------------------------
// CLI validators
// ---------------------------------------------------------------------------

fn validate_role(value: &str) -> Result<String, String> {
    match value {
        "pub" | "sub" | "node" => Ok(value.to_owned()),
        _ => Err("role must be one of: pub, sub, node".to_owned()),
    }
}

fn validate_qos(value: &str) -> Result<Qos, String> {
    value.parse()
}

fn validate_json_object(value: &str) -> Result<String, String> {
    match serde_json::from_str::<Value>(value) {
        Ok(Value::Object(_)) => Ok(value.to_owned()),
        Ok(_) => Err("payload must be a JSON object".to_owned()),
        Err(e) => Err(format!("invalid JSON: {}", e)),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    let matches = Command::new("busd")
        .version(env!("CARGO_PKG_VERSION"))
        .about("LAN publish/subscribe bus node")
        .arg(
            Arg::new("config")
                .help("Path to the TOML config file")
                .short('c')
                .long("config")
                .default_value("lanbus.toml"),
        )
        .arg(
            Arg::new("role")
                .help("Run as a publisher (pub), subscriber (sub) or plain node")
                .short('r')
                .long("role")
                .value_parser(validate_role)
                .default_value("node"),
        )
        .arg(
            Arg::new("topic")
                .help("Topic to publish or subscribe on")
                .short('t')
                .long("topic")
                .default_value("t1"),
        )
        .arg(
            Arg::new("qos")
                .help("QoS for published messages; defaults to qos.default from the config")
                .long("qos")
                .value_parser(validate_qos),
        )
        .arg(
            Arg::new("payload")
                .help("JSON object payload for the publisher role")
                .long("payload")
                .value_parser(validate_json_object),
        )
        .arg(
            Arg::new("count")
                .help("Number of messages the publisher sends")
                .short('n')
                .long("count")
                .value_parser(clap::value_parser!(u32))
                .default_value("1"),
        )
        .arg(
            Arg::new("interval_ms")
                .help("Delay between published messages")
                .long("interval-ms")
                .value_parser(clap::value_parser!(u64))
                .default_value("1000"),
        )
        .arg(
            Arg::new("start_delay_ms")
                .help("Delay before the first publish")
                .long("start-delay-ms")
                .value_parser(clap::value_parser!(u64))
                .default_value("0"),
        )
        .arg(
            Arg::new("run_for_sec")
                .help("Exit automatically after this many seconds")
                .long("run-for-sec")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("print_recv")
                .help("Print a RECV line for every delivery")
                .long("print-recv")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("log_level")
                .help("Override logging.level from the config")
                .long("log-level"),
        )
        .get_matches();

    let config_path = PathBuf::from(matches.get_one::<String>("config").expect("has default"));
    let cfg = match config::load_config_from_path(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let level = matches
        .get_one::<String>("log_level")
        .cloned()
        .unwrap_or_else(|| cfg.logging.level.clone());
    let log_handle = logging::init(&level, cfg.logging.file.as_deref());

    info!(
        version = env!("CARGO_PKG_VERSION"),
        node = %cfg.node_id,
        "busd starting"
    );

    // Data transport. Bind failure already retried on an ephemeral port
    // inside; a second failure means the engine must refuse to start.
    let transport = match UdpTransport::bind(cfg.transport.udp.port).await {
        Ok(t) => Arc::new(t),
        Err(e) => {
            error!(error = %e, "data transport unusable, refusing to start");
            std::process::exit(1);
        }
    };
    let data_port = transport.bound_port();

    let peers = Arc::new(PeerTable::new());
    let bus = Bus::new(bus_config(&cfg), Arc::clone(&transport), Arc::clone(&peers));
    bus.start();

    let discovery = if cfg.discovery.enabled {
        match Discovery::start(
            discovery_config(&cfg),
            announcement(&cfg, data_port),
            Arc::clone(&peers),
            None,
        )
        .await
        {
            Ok(d) => Some(Arc::new(d)),
            Err(e) => {
                error!(error = %e, "discovery failed to start, continuing without membership");
                None
            }
        }
    } else {
        info!("discovery disabled");
        None
    };

    // Optional stream transport: frames are routed through the bus engine.
    let stream = start_stream(&cfg, &bus).await;

    spawn_reload_task(
        config_path,
        cfg.clone(),
        log_handle,
        discovery.clone(),
    );

    let role = matches.get_one::<String>("role").expect("has default").clone();
    let topic = matches.get_one::<String>("topic").expect("has default").clone();
    let run_for_sec = matches.get_one::<u64>("run_for_sec").copied();

    info!(role = %role, topic = %topic, "role configured");

    match role.as_str() {
        "pub" => {
            let qos = matches
                .get_one::<Qos>("qos")
                .copied()
                .unwrap_or_else(|| cfg.qos.default_qos.parse().unwrap_or(Qos::BestEffort));
            let payload = matches
                .get_one::<String>("payload")
                .map(|p| as_object(p))
                .unwrap_or_else(default_payload);
            let count = *matches.get_one::<u32>("count").expect("has default");
            let interval = Duration::from_millis(
                *matches.get_one::<u64>("interval_ms").expect("has default"),
            );
            let delay = Duration::from_millis(
                *matches.get_one::<u64>("start_delay_ms").expect("has default"),
            );
            run_sender(&bus, &topic, qos, payload, count, interval, delay).await;
        }
        "sub" => {
            let print_recv = matches.get_flag("print_recv");
            let sub_topic = topic.clone();
            bus.subscribe(&topic, move |enriched| {
                let rendered = Value::Object(enriched.clone());
                info!(
                    topic = enriched.get("topic").and_then(serde_json::Value::as_str).unwrap_or(""),
                    qos = enriched.get("qos").and_then(serde_json::Value::as_str).unwrap_or(""),
                    mid = enriched.get("message_id").and_then(serde_json::Value::as_i64).unwrap_or(0),
                    payload = %rendered,
                    "message delivered"
                );
                if print_recv {
                    println!("RECV topic={} payload={}", sub_topic, rendered);
                }
            });
            wait_for_exit(run_for_sec).await;
        }
        _ => {
            wait_for_exit(run_for_sec).await;
        }
    }

    // Graceful shutdown: drain the bus first, discovery afterwards.
    info!("shutdown: starting graceful shutdown");
    bus.shutdown(SHUTDOWN_DRAIN_MS).await;
    if let Some(d) = &discovery {
        d.stop();
    }
    if let Some(s) = &stream {
        s.stop().await;
    }
    info!(
        pending = bus.pending_len(),
        dead_letters = bus.dead_letters().len(),
        acks = bus.ack_count(),
        "shutdown complete"
    );
}

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

async fn run_sender(
    bus: &Arc<Bus>,
    topic: &str,
    qos: Qos,
    payload: Map<String, Value>,
    count: u32,
    interval: Duration,
    delay: Duration,
) {
    if !delay.is_zero() {
        info!(delay_ms = delay.as_millis() as u64, "sender start delay");
        sleep(delay).await;
    }
    // Brief warm-up so the first discovery exchange can land.
    sleep(Duration::from_millis(100)).await;

    for i in 0..count {
        let mid = bus.publish(topic, payload.clone(), qos).await;
        info!(mid, topic = %topic, qos = %qos, "published");
        if i + 1 < count {
            sleep(interval).await;
        }
    }
    info!(count, "sender completed");
}

async fn wait_for_exit(run_for_sec: Option<u64>) {
    let budget = async {
        match run_for_sec {
            Some(secs) => sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
        _ = sigterm() => info!("terminate received"),
        _ = budget => info!("run budget elapsed"),
    }
}

#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut s) => {
            s.recv().await;
        }
        Err(_) => std::future::pending::<()>().await,
    }
}

#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending::<()>().await
}

// ---------------------------------------------------------------------------
// Wiring helpers
// ---------------------------------------------------------------------------

fn bus_config(cfg: &Config) -> BusConfig {
    BusConfig {
        node_id: cfg.node_id.clone(),
        protocol_version: cfg.protocol_version.clone(),
        qos: QosConfig {
            default_qos: cfg.qos.default_qos.parse().unwrap_or(Qos::BestEffort),
            reliable: ReliableConfig {
                ack_timeout_ms: cfg.qos.ack_timeout_ms,
                max_retries: cfg.qos.max_retries,
                exponential_backoff: cfg.qos.exponential_backoff,
            },
            dedup_capacity: cfg.qos.dedup_capacity,
            retain_last: cfg.qos.retain_last,
        },
        serialization: SerializationConfig {
            format: cfg.serialization.format.clone(),
            supported: cfg.serialization.supported.clone(),
            allow_json_fallback: cfg.serialization.allow_json_fallback,
        },
        data_port: cfg.transport.udp.port,
        deadletter_file: Some(PathBuf::from(&cfg.logging.deadletter_file)),
        loopback: false,
    }
}

fn discovery_config(cfg: &Config) -> DiscoveryConfig {
    DiscoveryConfig {
        port: cfg.discovery.port,
        mode: if cfg.discovery.mode == "multicast" {
            DiscoveryMode::Multicast
        } else {
            DiscoveryMode::Broadcast
        },
        multicast_addr: cfg.discovery.address,
        multicast_ttl: cfg.discovery.ttl,
        interval: Duration::from_millis(cfg.discovery.interval_ms),
        ..DiscoveryConfig::default()
    }
}

fn announcement(cfg: &Config, data_port: u16) -> Announcement {
    Announcement {
        node_id: cfg.node_id.clone(),
        topics: cfg.topics.clone(),
        protocol_version: cfg.protocol_version.clone(),
        formats: cfg.serialization.supported.clone(),
        // The actually bound port, not the configured one.
        data_port,
        stream_port: cfg.transport.tcp.listen.then_some(cfg.transport.tcp.port),
    }
}

async fn start_stream(cfg: &Config, bus: &Arc<Bus>) -> Option<Arc<StreamTransport>> {
    let tcp = &cfg.transport.tcp;
    if !tcp.listen && tcp.connect.is_empty() {
        return None;
    }
    let stream_cfg = StreamConfig {
        listen: tcp.listen,
        port: tcp.port,
        connect: tcp.connect.clone(),
        connect_timeout: Duration::from_millis(tcp.connect_timeout_ms),
        reconnect_backoff: Duration::from_millis(tcp.reconnect_backoff_ms),
        max_reconnect_attempts: tcp.max_reconnect_attempts,
    };
    let (tx, mut rx) = mpsc::channel(256);
    match StreamTransport::start(stream_cfg, tx).await {
        Ok(stream) => {
            bus.attach_stream(Arc::clone(&stream));
            let bus = Arc::clone(bus);
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    match event {
                        StreamEvent::Frame {
                            msg_type,
                            payload,
                            from,
                        } => bus.handle_stream_frame(msg_type, &payload, from).await,
                        StreamEvent::Connected(addr) => info!(peer = %addr, "stream connected"),
                        StreamEvent::Disconnected(addr) => {
                            info!(peer = %addr, "stream disconnected");
                        }
                    }
                }
            });
            Some(stream)
        }
        Err(e) => {
            error!(error = %e, "stream transport failed to start");
            None
        }
    }
}

fn spawn_reload_task(
    path: PathBuf,
    initial: Config,
    log_handle: logging::LogHandle,
    discovery: Option<Arc<Discovery>>,
) {
    #[cfg(unix)]
    {
        tokio::spawn(async move {
            use tokio::signal::unix::{SignalKind, signal};
            let mut hup = match signal(SignalKind::hangup()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "SIGHUP handler unavailable, config reload disabled");
                    return;
                }
            };
            let mut current = initial;
            while hup.recv().await.is_some() {
                match config::load_config_from_path(&path) {
                    Ok(new_cfg) => {
                        let plan = config::reload_diff(&current, &new_cfg);
                        for warning in &plan.warnings {
                            warn!("{}", warning);
                        }
                        if let Some(level) = &plan.log_level {
                            log_handle.set_level(level);
                            info!(level = %level, "log level reloaded");
                        }
                        if let Some(ms) = plan.discovery_interval_ms {
                            if let Some(d) = &discovery {
                                d.set_interval(Duration::from_millis(ms));
                            }
                        }
                        current = new_cfg;
                        info!("config reloaded");
                    }
                    Err(e) => warn!(error = %e, "config reload failed, keeping previous config"),
                }
            }
        });
    }
    #[cfg(not(unix))]
    {
        let _ = (path, initial, log_handle, discovery);
    }
}

fn default_payload() -> Map<String, Value> {
    as_object(&json!({"value": 23.5, "unit": "C"}).to_string())
}

fn as_object(raw: &str) -> Map<String, Value> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}
