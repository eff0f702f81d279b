//! Framed stream transport.
//!
//! Connection-oriented companion to the datagram path: a TCP listener plus
//! configured outbound connections, carrying `lb_codec::frame` frames. Every
//! broadcast frame goes to all live connections; a connection that fails a
//! write is silently removed. Outbound connections that drop are re-dialed
//! with a fixed backoff up to a cap, then abandoned with a warning.

use lb_codec::frame;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep, timeout};
use tracing::{debug, info, warn};

use crate::transport::TransportError;

/// Connection lifecycle and traffic events.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Connected(SocketAddr),
    Disconnected(SocketAddr),
    Frame {
        msg_type: u8,
        payload: Vec<u8>,
        from: SocketAddr,
    },
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub listen: bool,
    pub port: u16,
    /// Outbound `(host, port)` pairs dialed at startup.
    pub connect: Vec<(String, u16)>,
    pub connect_timeout: Duration,
    pub reconnect_backoff: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for StreamConfig {
    fn default() -> StreamConfig {
        StreamConfig {
            listen: false,
            port: 39100,
            connect: Vec::new(),
            connect_timeout: Duration::from_millis(3000),
            reconnect_backoff: Duration::from_millis(1000),
            max_reconnect_attempts: 5,
        }
    }
}

struct Conn {
    addr: SocketAddr,
    writer: OwnedWriteHalf,
}

pub struct StreamTransport {
    conns: Arc<Mutex<Vec<Conn>>>,
    local_port: u16,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamTransport {
    /// Bind the listener (when configured) and dial the configured peers.
    /// All lifecycle and traffic lands on `events`.
    pub async fn start(
        cfg: StreamConfig,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<Arc<StreamTransport>, TransportError> {
        let conns: Arc<Mutex<Vec<Conn>>> = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        let mut local_port = 0;

        if cfg.listen {
            let listener = TcpListener::bind(("0.0.0.0", cfg.port))
                .await
                .map_err(TransportError::Bind)?;
            local_port = listener
                .local_addr()
                .map(|a| a.port())
                .unwrap_or(cfg.port);
            info!(port = local_port, "stream transport listening");

            let conns_accept = Arc::clone(&conns);
            let events_accept = events.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, addr)) => {
                            attach(stream, addr, &conns_accept, &events_accept).await;
                        }
                        Err(e) => {
                            warn!(error = %e, "stream accept failed");
                        }
                    }
                }
            }));
        }

        for (host, port) in cfg.connect.clone() {
            let conns_dial = Arc::clone(&conns);
            let events_dial = events.clone();
            let cfg_dial = cfg.clone();
            tasks.push(tokio::spawn(async move {
                dial_loop(host, port, cfg_dial, conns_dial, events_dial).await;
            }));
        }

        Ok(Arc::new(StreamTransport {
            conns,
            local_port,
            tasks: Mutex::new(tasks),
        }))
    }

    /// The listener port, or 0 when not listening.
    pub fn bound_port(&self) -> u16 {
        self.local_port
    }

    /// Write one frame to every live connection. Connections that fail the
    /// write are dropped. Returns true when at least one peer got the frame.
    pub async fn broadcast_frame(&self, msg_type: u8, payload: &[u8]) -> bool {
        let bytes = frame::encode_frame(msg_type, payload);
        let mut conns = self.conns.lock().await;
        let mut any = false;
        let mut alive = Vec::with_capacity(conns.len());
        for mut conn in conns.drain(..) {
            match conn.writer.write_all(&bytes).await {
                Ok(()) => {
                    any = true;
                    alive.push(conn);
                }
                Err(e) => {
                    debug!(peer = %conn.addr, error = %e, "stream write failed, dropping connection");
                }
            }
        }
        *conns = alive;
        any
    }

    pub async fn connection_count(&self) -> usize {
        self.conns.lock().await.len()
    }

    /// Stop accepting, dialing and reading; live connections are dropped.
    pub async fn stop(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.conns.lock().await.clear();
    }
}

// ---------------------------------------------------------------------------
// Connection handling
// ---------------------------------------------------------------------------

/// Register a connection and spawn its read loop. The read half lives in the
/// spawned task; the write half joins the fan-out registry.
async fn attach(
    stream: TcpStream,
    addr: SocketAddr,
    conns: &Arc<Mutex<Vec<Conn>>>,
    events: &mpsc::Sender<StreamEvent>,
) {
    let (mut reader, writer) = stream.into_split();
    conns.lock().await.push(Conn { addr, writer });
    let _ = events.send(StreamEvent::Connected(addr)).await;
    info!(peer = %addr, "stream peer connected");

    let conns = Arc::clone(conns);
    let events = events.clone();
    tokio::spawn(async move {
        let mut rx_buf: Vec<u8> = Vec::new();
        let mut chunk = vec![0u8; 16 * 1024];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    rx_buf.extend_from_slice(&chunk[..n]);
                    while let Some((msg_type, payload)) = frame::try_decode_frame(&mut rx_buf) {
                        let _ = events
                            .send(StreamEvent::Frame {
                                msg_type,
                                payload,
                                from: addr,
                            })
                            .await;
                    }
                }
            }
        }
        conns.lock().await.retain(|c| c.addr != addr);
        let _ = events.send(StreamEvent::Disconnected(addr)).await;
        info!(peer = %addr, "stream peer disconnected");
    });
}

/// Dial one configured peer, re-dialing with fixed backoff after failures.
/// The attempt counter resets after every successful session; once it hits
/// the cap the peer is abandoned.
async fn dial_loop(
    host: String,
    port: u16,
    cfg: StreamConfig,
    conns: Arc<Mutex<Vec<Conn>>>,
    events: mpsc::Sender<StreamEvent>,
) {
    let mut attempts: u32 = 0;
    loop {
        match timeout(cfg.connect_timeout, TcpStream::connect((host.as_str(), port))).await {
            Ok(Ok(stream)) => {
                attempts = 0;
                let addr = stream
                    .peer_addr()
                    .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));
                attach(stream, addr, &conns, &events).await;
                // Wait for the session to drop before re-dialing.
                loop {
                    sleep(cfg.reconnect_backoff).await;
                    if !conns.lock().await.iter().any(|c| c.addr == addr) {
                        break;
                    }
                }
            }
            Ok(Err(e)) => {
                attempts += 1;
                debug!(host = %host, port, attempts, error = %e, "stream connect failed");
            }
            Err(_) => {
                attempts += 1;
                debug!(host = %host, port, attempts, "stream connect timed out");
            }
        }
        if attempts >= cfg.max_reconnect_attempts {
            warn!(host = %host, port, attempts, "giving up on stream peer");
            return;
        }
        sleep(cfg.reconnect_backoff).await;
    }
}
