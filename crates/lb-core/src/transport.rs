//! Datagram transport.
//!
//! Owns one UDP socket for data traffic. Inbound datagrams are pumped into an
//! mpsc channel together with their origin address; outbound sends are
//! length-checked so a short write surfaces as an error instead of silent
//! truncation.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One inbound datagram and where it came from.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub bytes: Vec<u8>,
    pub from: SocketAddr,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum TransportError {
    Bind(std::io::Error),
    Send(std::io::Error),
    ShortWrite { sent: usize, len: usize },
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Bind(e) => write!(f, "bind failed: {}", e),
            TransportError::Send(e) => write!(f, "send failed: {}", e),
            TransportError::ShortWrite { sent, len } => {
                write!(f, "short write: {} of {} bytes", sent, len)
            }
        }
    }
}

impl std::error::Error for TransportError {}

// ---------------------------------------------------------------------------
// UdpTransport
// ---------------------------------------------------------------------------

/// Connectionless datagram transport.
pub struct UdpTransport {
    sock: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind the data socket on `0.0.0.0:port` with broadcast enabled.
    ///
    /// A failure on the requested port falls back to an ephemeral port; if
    /// that also fails the transport is unusable and the caller must refuse
    /// to start.
    pub async fn bind(port: u16) -> Result<UdpTransport, TransportError> {
        let sock = match UdpSocket::bind(("0.0.0.0", port)).await {
            Ok(s) => s,
            Err(e) => {
                warn!(port, error = %e, "udp bind failed, retrying on an ephemeral port");
                UdpSocket::bind(("0.0.0.0", 0))
                    .await
                    .map_err(TransportError::Bind)?
            }
        };
        sock.set_broadcast(true).map_err(TransportError::Bind)?;
        let transport = UdpTransport {
            sock: Arc::new(sock),
        };
        info!(port = transport.bound_port(), "udp transport bound");
        Ok(transport)
    }

    /// The actually bound port (differs from the requested one after an
    /// ephemeral fallback).
    pub fn bound_port(&self) -> u16 {
        self.sock.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Unicast `bytes` to `host:port`.
    pub async fn send(&self, bytes: &[u8], host: IpAddr, port: u16) -> Result<(), TransportError> {
        let sent = self
            .sock
            .send_to(bytes, (host, port))
            .await
            .map_err(TransportError::Send)?;
        if sent != bytes.len() {
            return Err(TransportError::ShortWrite {
                sent,
                len: bytes.len(),
            });
        }
        Ok(())
    }

    /// Broadcast `bytes` to the well-known data port on the local segment.
    pub async fn send_broadcast(&self, bytes: &[u8], port: u16) -> Result<(), TransportError> {
        self.send(bytes, IpAddr::V4(Ipv4Addr::BROADCAST), port)
            .await
    }

    /// Spawn the receive pump. Runs until the channel closes.
    pub fn spawn_recv(&self, tx: mpsc::Sender<Inbound>) -> JoinHandle<()> {
        let sock = Arc::clone(&self.sock);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match sock.recv_from(&mut buf).await {
                    Ok((n, from)) => {
                        let inbound = Inbound {
                            bytes: buf[..n].to_vec(),
                            from,
                        };
                        if tx.send(inbound).await.is_err() {
                            debug!("inbound channel closed, stopping udp pump");
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "udp recv failed");
                    }
                }
            }
        })
    }
}
