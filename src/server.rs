use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::protocol::Packet;
use crate::session::{ReadSession, Request, WriteSession};
use crate::target::Handler;

/// Requests are read into a buffer of this size; the well-known port only
/// ever carries RRQ/WRQ datagrams, which fit in 512 bytes.
const REQUEST_BUF: usize = 512;

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address of the well-known UDP port.
    pub bind_addr: SocketAddr,
    /// Retransmit budget per outstanding packet.
    pub retries: u32,
    /// Default wait for a reply before retransmitting; a session may
    /// renegotiate its own via the `timeout` option.
    pub timeout: Duration,
    /// Cap on concurrent transfers. Requests past the cap are dropped,
    /// never queued.
    pub max_sessions: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: "0.0.0.0:69".parse().expect("static address"),
            retries: 3,
            timeout: Duration::from_secs(5),
            max_sessions: None,
        }
    }
}

/// The session dispatcher: owns the well-known port, parses requests and
/// spawns one task per transfer. Each session binds its own ephemeral
/// socket, so this port never carries DATA or ACK traffic.
pub struct Server<H: Handler> {
    socket: UdpSocket,
    config: ServerConfig,
    handler: Arc<H>,
    limiter: Option<Arc<Semaphore>>,
}

impl<H: Handler> Server<H> {
    pub async fn bind(config: ServerConfig, handler: H) -> io::Result<Self> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        let limiter = config
            .max_sessions
            .map(|n| Arc::new(Semaphore::new(n)));
        Ok(Server {
            socket,
            config,
            handler: Arc::new(handler),
            limiter,
        })
    }

    /// The actual bound address; useful when binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve requests until the listener socket fails.
    pub async fn run(self) -> io::Result<()> {
        let local = self.local_addr()?;
        let server_ip = local.ip();
        info!(addr = %local, "listening");

        let mut buf = [0u8; REQUEST_BUF];
        loop {
            let (n, peer) = self.socket.recv_from(&mut buf).await?;

            let packet = match Packet::from_bytes(&buf[..n]) {
                Ok(packet) => packet,
                Err(e) => {
                    debug!(%peer, error = %e, "discarding malformed datagram");
                    continue;
                }
            };

            let (request, is_write) = match packet {
                Packet::RRQ {
                    filename,
                    mode,
                    options,
                } => (
                    Request {
                        filename,
                        mode,
                        options,
                    },
                    false,
                ),
                Packet::WRQ {
                    filename,
                    mode,
                    options,
                } => (
                    Request {
                        filename,
                        mode,
                        options,
                    },
                    true,
                ),
                _ => {
                    debug!(%peer, "discarding non-request on listener");
                    continue;
                }
            };

            let permit = match &self.limiter {
                Some(limiter) => match Arc::clone(limiter).try_acquire_owned() {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        warn!(%peer, "session limit reached, dropping request");
                        continue;
                    }
                },
                None => None,
            };

            let handler = Arc::clone(&self.handler);
            let retries = self.config.retries;
            let timeout = self.config.timeout;

            if is_write {
                let session =
                    WriteSession::new(request, handler, server_ip, peer, retries, timeout);
                tokio::spawn(async move {
                    session.run().await;
                    drop(permit);
                });
            } else {
                let session =
                    ReadSession::new(request, handler, server_ip, peer, retries, timeout);
                tokio::spawn(async move {
                    session.run().await;
                    drop(permit);
                });
            }
        }
    }
}
