use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::error::SessionError;
use crate::netascii::{NetasciiReader, NetasciiWriter};
use crate::protocol::{
    BLOCK_SIZE, ErrorCode, MAX_BLKSIZE, MAX_PACKET, MIN_BLKSIZE, Mode, Packet,
};
use crate::target::{Handler, ReadTarget, read_block};

/// A parsed RRQ or WRQ, as handed from the dispatcher to a session.
#[derive(Debug, Clone)]
pub struct Request {
    pub filename: String,
    pub mode: Mode,
    pub options: HashMap<String, String>,
}

/// Block numbers wrap past 65535 straight to 1; 0 stays reserved for the
/// acknowledgement of an OACK.
fn next_block(block_num: u16) -> u16 {
    if block_num == u16::MAX { 1 } else { block_num + 1 }
}

/// A dual-stack v6 listener surfaces plain IPv4 clients as v4-mapped
/// addresses (`::ffff:a.b.c.d`); sessions identify and log their peer in
/// the plain form, so the mapping is stripped up front.
fn normalize_peer(server_ip: IpAddr, peer: SocketAddr) -> SocketAddr {
    if server_ip.is_ipv6()
        && let IpAddr::V6(v6) = peer.ip()
        && let Some(v4) = v6.to_ipv4_mapped()
    {
        return SocketAddr::new(IpAddr::V4(v4), peer.port());
    }
    peer
}

/// Inverse of [`normalize_peer`] for the send path: a v6 socket can only
/// address a v4 peer through its v4-mapped form.
fn wire_peer(server_ip: IpAddr, peer: SocketAddr) -> SocketAddr {
    if server_ip.is_ipv6()
        && let IpAddr::V4(v4) = peer.ip()
    {
        return SocketAddr::new(IpAddr::V6(v4.to_ipv6_mapped()), peer.port());
    }
    peer
}

/// Socket buffers are sized before negotiation runs; the requested value
/// is a good enough guess, clamped into the legal range.
fn blksize_hint(options: &HashMap<String, String>) -> usize {
    options
        .get("blksize")
        .and_then(|v| v.parse::<usize>().ok())
        .map(|v| v.clamp(MIN_BLKSIZE, MAX_BLKSIZE))
        .unwrap_or(BLOCK_SIZE)
}

/// Create the transfer socket on an ephemeral port, with send/receive
/// buffers sized for the block size. The OS default buffer (~9 KB on
/// macOS) is too small for blksize values above ~8 KB and causes "No
/// buffer space available" (ENOBUFS) on send.
///
/// The socket stays unconnected: datagrams from a wrong peer must still
/// reach the session so it can refuse them with ERROR 0.
async fn bind_session_socket(server_ip: IpAddr, blksize: usize) -> io::Result<UdpSocket> {
    let domain = if server_ip.is_ipv6() {
        socket2::Domain::IPV6
    } else {
        socket2::Domain::IPV4
    };
    let raw = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;

    let buf_size = (4 + blksize) * 2;
    let _ = raw.set_send_buffer_size(buf_size);
    let _ = raw.set_recv_buffer_size(buf_size);

    raw.bind(&SocketAddr::new(server_ip, 0).into())?;
    raw.set_nonblocking(true)?;

    let std_sock: std::net::UdpSocket = raw.into();
    UdpSocket::from_std(std_sock)
}

// ---------------------------------------------------------------------------
// Session I/O: the socket, the retransmit budget and the outstanding packet
// ---------------------------------------------------------------------------

struct SessionIo {
    socket: UdpSocket,
    /// Peer in the socket family's own form (v4-mapped on a v6 socket),
    /// matching what `recv_from` reports and what `send_to` accepts.
    peer: SocketAddr,
    timeout: Duration,
    retries: u32,
    retransmits: u32,
    last_sent: Option<Packet>,
    recv_buf: Vec<u8>,
}

impl SessionIo {
    async fn bind(
        server_ip: IpAddr,
        peer: SocketAddr,
        blksize: usize,
        retries: u32,
        timeout: Duration,
    ) -> io::Result<Self> {
        let socket = bind_session_socket(server_ip, blksize).await?;
        Ok(SessionIo {
            socket,
            peer: wire_peer(server_ip, peer),
            timeout,
            retries,
            retransmits: 0,
            last_sent: None,
            recv_buf: vec![0u8; MAX_PACKET],
        })
    }

    /// Transmit a fresh packet and retain it for retransmission.
    async fn send(&mut self, packet: Packet) -> Result<(), SessionError> {
        self.socket.send_to(&packet.to_bytes(), self.peer).await?;
        self.last_sent = Some(packet);
        self.retransmits = 0;
        Ok(())
    }

    /// Retransmit the outstanding packet, or give up once the budget is
    /// spent.
    async fn retransmit_last(&mut self) -> Result<(), SessionError> {
        if self.retransmits >= self.retries {
            return Err(SessionError::TransmitTimeout {
                retries: self.retries,
            });
        }
        if let Some(packet) = self.last_sent.as_ref() {
            debug!(peer = %self.peer, attempt = self.retransmits + 1, "retransmitting");
            self.socket.send_to(&packet.to_bytes(), self.peer).await?;
        }
        self.retransmits += 1;
        Ok(())
    }

    /// Block number the peer must acknowledge next: the block of the
    /// outstanding DATA, or 0 when the outstanding packet is an OACK.
    fn expected_ack(&self) -> u16 {
        match &self.last_sent {
            Some(Packet::DATA { block_num, .. }) => *block_num,
            _ => 0,
        }
    }

    /// Number for the next DATA block to send.
    fn next_block_num(&self) -> u16 {
        match &self.last_sent {
            Some(Packet::DATA { block_num, .. }) => next_block(*block_num),
            _ => 1,
        }
    }

    /// Receive one datagram before `deadline` expires. `Ok(None)` signals
    /// the deadline; a datagram from anyone but the session peer is a
    /// terminal local error.
    async fn recv(&mut self, deadline: Instant) -> Result<Option<usize>, SessionError> {
        match time::timeout_at(deadline, self.socket.recv_from(&mut self.recv_buf)).await {
            Err(_) => Ok(None),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok((n, from))) => {
                if from != self.peer {
                    warn!(peer = %self.peer, %from, "dropping session, packet from wrong peer");
                    return Err(SessionError::local(
                        ErrorCode::Undefined,
                        format!("packet from wrong peer {from}"),
                    ));
                }
                Ok(Some(n))
            }
        }
    }

    /// Wait one timeout window for the ACK of `expected`. Stale ACKs are
    /// discarded without resetting the timer; `Ok(false)` means the window
    /// elapsed.
    async fn wait_ack(&mut self, expected: u16) -> Result<bool, SessionError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let n = match self.recv(deadline).await? {
                Some(n) => n,
                None => return Ok(false),
            };
            match Packet::from_bytes(&self.recv_buf[..n]) {
                Ok(Packet::ACK { block_num }) if block_num == expected => {
                    self.retransmits = 0;
                    return Ok(true);
                }
                Ok(Packet::ACK { .. }) => continue, // duplicate or delayed
                Ok(Packet::ERROR { code, msg }) => {
                    return Err(SessionError::Peer {
                        code,
                        message: msg,
                    });
                }
                Ok(_) | Err(_) => {
                    return Err(SessionError::local(
                        ErrorCode::IllegalOperation,
                        "expecting an ACK",
                    ));
                }
            }
        }
    }

    /// Wait one timeout window for DATA block `expected` and yield its
    /// payload. Duplicates of earlier blocks are discarded; `Ok(None)`
    /// means the window elapsed.
    async fn wait_data(&mut self, expected: u16) -> Result<Option<Vec<u8>>, SessionError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let n = match self.recv(deadline).await? {
                Some(n) => n,
                None => return Ok(None),
            };
            match Packet::from_bytes(&self.recv_buf[..n]) {
                Ok(Packet::DATA { block_num, data }) if block_num == expected => {
                    self.retransmits = 0;
                    return Ok(Some(data));
                }
                Ok(Packet::DATA { .. }) => continue, // retransmission of an earlier block
                Ok(Packet::ERROR { code, msg }) => {
                    return Err(SessionError::Peer {
                        code,
                        message: msg,
                    });
                }
                Ok(_) | Err(_) => {
                    return Err(SessionError::local(
                        ErrorCode::IllegalOperation,
                        "expecting a DATA block",
                    ));
                }
            }
        }
    }

    /// Best-effort delivery of a terminal ERROR; the session is closing
    /// either way.
    async fn send_error(&mut self, code: ErrorCode, message: &str) {
        let packet = Packet::error(code, message);
        if let Err(e) = self.socket.send_to(&packet.to_bytes(), self.peer).await {
            debug!(peer = %self.peer, error = %e, "could not deliver ERROR packet");
        }
    }
}

// ---------------------------------------------------------------------------
// Option negotiation (RFC 2347/2348/2349)
// ---------------------------------------------------------------------------

fn parse_blksize(value: &str) -> Result<usize, SessionError> {
    let size: usize = value.parse().map_err(|_| {
        SessionError::local(
            ErrorCode::InvalidOptions,
            format!("invalid block size {value}."),
        )
    })?;
    if !(MIN_BLKSIZE..=MAX_BLKSIZE).contains(&size) {
        return Err(SessionError::local(
            ErrorCode::InvalidOptions,
            format!("block size value ({size}) is out of range({MIN_BLKSIZE}-{MAX_BLKSIZE})."),
        ));
    }
    Ok(size)
}

fn parse_timeout_secs(value: &str) -> Result<u64, SessionError> {
    let secs: u64 = value.parse().map_err(|_| {
        SessionError::local(
            ErrorCode::InvalidOptions,
            format!("invalid timeout {value}."),
        )
    })?;
    if !(1..=255).contains(&secs) {
        return Err(SessionError::local(
            ErrorCode::InvalidOptions,
            format!("timeout value ({secs}) is out of range(1-255)."),
        ));
    }
    Ok(secs)
}

fn parse_tsize(value: &str) -> Result<u64, SessionError> {
    value.parse().map_err(|_| {
        SessionError::local(
            ErrorCode::InvalidOptions,
            format!("invalid transfer size {value}."),
        )
    })
}

// ---------------------------------------------------------------------------
// Mode wrappers around the embedder's targets
// ---------------------------------------------------------------------------

enum Reader<R: Read> {
    Plain(R),
    Netascii(NetasciiReader<R>),
}

impl<R: Read> Read for Reader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Reader::Plain(r) => r.read(buf),
            Reader::Netascii(r) => r.read(buf),
        }
    }
}

impl<R: ReadTarget> ReadTarget for Reader<R> {
    fn size(&mut self) -> io::Result<Option<u64>> {
        match self {
            Reader::Plain(r) => r.size(),
            Reader::Netascii(r) => r.size(),
        }
    }
}

enum Writer<W: Write> {
    Plain(W),
    Netascii(NetasciiWriter<W>),
}

impl<W: Write> Write for Writer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Writer::Plain(w) => w.write(buf),
            Writer::Netascii(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Writer::Plain(w) => w.flush(),
            Writer::Netascii(w) => w.flush(),
        }
    }
}

// ---------------------------------------------------------------------------
// Read session (client downloads from us)
// ---------------------------------------------------------------------------

/// Serves one RRQ over its own ephemeral socket, in lock-step: send DATA,
/// wait for its ACK, repeat until a short block ends the transfer.
pub struct ReadSession<H: Handler> {
    handler: Arc<H>,
    request: Request,
    server_ip: IpAddr,
    peer: SocketAddr,
    retries: u32,
    timeout: Duration,
    blksize: usize,
    should_stop: bool,
}

impl<H: Handler> ReadSession<H> {
    pub fn new(
        request: Request,
        handler: Arc<H>,
        server_ip: IpAddr,
        peer: SocketAddr,
        retries: u32,
        timeout: Duration,
    ) -> Self {
        let peer = normalize_peer(server_ip, peer);
        ReadSession {
            handler,
            request,
            server_ip,
            peer,
            retries,
            timeout,
            blksize: BLOCK_SIZE,
            should_stop: false,
        }
    }

    /// Execute the transfer to completion or failure. Every terminal
    /// condition is handled here: a local error is reported to the peer
    /// once, everything else is only logged.
    pub async fn run(mut self) {
        let peer = self.peer;
        info!(%peer, file = %self.request.filename, mode = %self.request.mode, "read request");

        let hint = blksize_hint(&self.request.options);
        let mut io =
            match SessionIo::bind(self.server_ip, peer, hint, self.retries, self.timeout).await {
                Ok(io) => io,
                Err(e) => {
                    error!(%peer, error = %e, "failed to bind session socket");
                    return;
                }
            };

        match self.transfer(&mut io).await {
            Ok(()) => info!(%peer, file = %self.request.filename, "read transfer complete"),
            Err(SessionError::Local { code, message }) => {
                warn!(%peer, code = %code, message = %message, "read transfer failed");
                io.send_error(code, &message).await;
            }
            Err(SessionError::Peer { code, message }) => {
                warn!(%peer, code = %code, message = %message, "read transfer aborted by peer");
            }
            Err(SessionError::TransmitTimeout { retries }) => {
                warn!(%peer, retries, "read transfer abandoned, peer stopped answering");
            }
        }
    }

    async fn transfer(&mut self, io: &mut SessionIo) -> Result<(), SessionError> {
        let reader = self.handler.open_read(&self.request.filename)?;
        let mut target = match self.request.mode {
            Mode::Netascii => Reader::Netascii(NetasciiReader::new(reader)),
            Mode::Octet => Reader::Plain(reader),
        };

        let acked = self.apply_options(io, &mut target)?;
        if acked.is_empty() {
            self.send_next_block(io, &mut target).await?;
        } else {
            io.send(Packet::OACK { options: acked }).await?;
        }

        while !self.should_stop {
            let expected = io.expected_ack();
            if io.wait_ack(expected).await? {
                self.send_next_block(io, &mut target).await?;
            } else {
                io.retransmit_last().await?;
            }
        }

        // Dally: the transfer is only over once the final DATA is
        // acknowledged.
        let final_block = io.expected_ack();
        while !io.wait_ack(final_block).await? {
            io.retransmit_last().await?;
        }
        Ok(())
    }

    /// Read the next block from the target and send it; a block shorter
    /// than blksize is the last one.
    async fn send_next_block(
        &mut self,
        io: &mut SessionIo,
        target: &mut Reader<H::Reader>,
    ) -> Result<(), SessionError> {
        let data = read_block(target, self.blksize)?;
        if data.len() < self.blksize {
            self.should_stop = true;
        }
        let block_num = io.next_block_num();
        io.send(Packet::DATA { block_num, data }).await
    }

    fn apply_options(
        &mut self,
        io: &mut SessionIo,
        target: &mut Reader<H::Reader>,
    ) -> Result<HashMap<String, String>, SessionError> {
        let mut acked = HashMap::new();
        for (key, value) in &self.request.options {
            match key.as_str() {
                "blksize" => {
                    self.blksize = parse_blksize(value)?;
                    acked.insert("blksize".to_string(), self.blksize.to_string());
                }
                "timeout" => {
                    let secs = parse_timeout_secs(value)?;
                    io.timeout = Duration::from_secs(secs);
                    acked.insert("timeout".to_string(), secs.to_string());
                }
                "tsize" => {
                    // Silently omitted when the target cannot tell its size.
                    if let Some(size) = target.size()? {
                        acked.insert("tsize".to_string(), size.to_string());
                    }
                }
                _ => {} // unknown options are ignored per RFC 2347
            }
        }
        Ok(acked)
    }
}

// ---------------------------------------------------------------------------
// Write session (client uploads to us)
// ---------------------------------------------------------------------------

/// Serves one WRQ: acknowledge the request (ACK 0 or OACK), then receive
/// DATA blocks in lock-step until a short block ends the transfer.
pub struct WriteSession<H: Handler> {
    handler: Arc<H>,
    request: Request,
    server_ip: IpAddr,
    peer: SocketAddr,
    retries: u32,
    timeout: Duration,
    blksize: usize,
    tsize: Option<u64>,
}

impl<H: Handler> WriteSession<H> {
    pub fn new(
        request: Request,
        handler: Arc<H>,
        server_ip: IpAddr,
        peer: SocketAddr,
        retries: u32,
        timeout: Duration,
    ) -> Self {
        let peer = normalize_peer(server_ip, peer);
        WriteSession {
            handler,
            request,
            server_ip,
            peer,
            retries,
            timeout,
            blksize: BLOCK_SIZE,
            tsize: None,
        }
    }

    /// Execute the transfer to completion or failure; terminal conditions
    /// as in [`ReadSession::run`].
    pub async fn run(mut self) {
        let peer = self.peer;
        info!(%peer, file = %self.request.filename, mode = %self.request.mode, "write request");

        let hint = blksize_hint(&self.request.options);
        let mut io =
            match SessionIo::bind(self.server_ip, peer, hint, self.retries, self.timeout).await {
                Ok(io) => io,
                Err(e) => {
                    error!(%peer, error = %e, "failed to bind session socket");
                    return;
                }
            };

        match self.transfer(&mut io).await {
            Ok(()) => info!(%peer, file = %self.request.filename, "write transfer complete"),
            Err(SessionError::Local { code, message }) => {
                warn!(%peer, code = %code, message = %message, "write transfer failed");
                io.send_error(code, &message).await;
            }
            Err(SessionError::Peer { code, message }) => {
                warn!(%peer, code = %code, message = %message, "write transfer aborted by peer");
            }
            Err(SessionError::TransmitTimeout { retries }) => {
                warn!(%peer, retries, "write transfer abandoned, peer stopped answering");
            }
        }
    }

    async fn transfer(&mut self, io: &mut SessionIo) -> Result<(), SessionError> {
        // Validate options before touching storage so a rejected request
        // never leaves a file behind.
        let acked = self.apply_options(io)?;

        let writer = self.handler.open_write(&self.request.filename, self.tsize)?;
        let mut target = match self.request.mode {
            Mode::Netascii => Writer::Netascii(NetasciiWriter::new(writer)),
            Mode::Octet => Writer::Plain(writer),
        };

        if acked.is_empty() {
            io.send(Packet::ACK { block_num: 0 }).await?;
        } else {
            io.send(Packet::OACK { options: acked }).await?;
        }

        let mut expected: u16 = 1;
        loop {
            match io.wait_data(expected).await? {
                Some(data) => {
                    let last = data.len() < self.blksize;
                    target.write_all(&data)?;
                    io.send(Packet::ACK {
                        block_num: expected,
                    })
                    .await?;
                    if last {
                        target.flush()?;
                        return Ok(());
                    }
                    expected = next_block(expected);
                }
                None => io.retransmit_last().await?,
            }
        }
    }

    fn apply_options(&mut self, io: &mut SessionIo) -> Result<HashMap<String, String>, SessionError> {
        let mut acked = HashMap::new();
        for (key, value) in &self.request.options {
            match key.as_str() {
                "blksize" => {
                    self.blksize = parse_blksize(value)?;
                    acked.insert("blksize".to_string(), self.blksize.to_string());
                }
                "timeout" => {
                    let secs = parse_timeout_secs(value)?;
                    io.timeout = Duration::from_secs(secs);
                    acked.insert("timeout".to_string(), secs.to_string());
                }
                "tsize" => {
                    // The client declares the upload size; keep it for the
                    // target factory and echo it back.
                    let size = parse_tsize(value)?;
                    self.tsize = Some(size);
                    acked.insert("tsize".to_string(), size.to_string());
                }
                _ => {}
            }
        }
        Ok(acked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_numbers_wrap_to_one() {
        assert_eq!(next_block(1), 2);
        assert_eq!(next_block(65534), 65535);
        assert_eq!(next_block(u16::MAX), 1);
    }

    #[test]
    fn blksize_accepts_range() {
        assert_eq!(parse_blksize("8").unwrap(), 8);
        assert_eq!(parse_blksize("512").unwrap(), 512);
        assert_eq!(parse_blksize("65464").unwrap(), 65464);
    }

    #[test]
    fn blksize_out_of_range_has_exact_diagnostic() {
        match parse_blksize("4") {
            Err(SessionError::Local { code, message }) => {
                assert_eq!(code, ErrorCode::InvalidOptions);
                assert_eq!(message, "block size value (4) is out of range(8-65464).");
            }
            other => panic!("expected invalid-options error, got {other:?}"),
        }
        assert!(parse_blksize("65465").is_err());
    }

    #[test]
    fn blksize_rejects_garbage() {
        match parse_blksize("many") {
            Err(SessionError::Local { code, message }) => {
                assert_eq!(code, ErrorCode::InvalidOptions);
                assert_eq!(message, "invalid block size many.");
            }
            other => panic!("expected invalid-options error, got {other:?}"),
        }
    }

    #[test]
    fn timeout_bounds_are_enforced() {
        assert_eq!(parse_timeout_secs("1").unwrap(), 1);
        assert_eq!(parse_timeout_secs("255").unwrap(), 255);
        assert!(parse_timeout_secs("0").is_err());
        assert!(parse_timeout_secs("256").is_err());
        assert!(parse_timeout_secs("soon").is_err());
    }

    #[test]
    fn tsize_must_be_a_non_negative_integer() {
        assert_eq!(parse_tsize("0").unwrap(), 0);
        assert_eq!(parse_tsize("1048576").unwrap(), 1048576);
        assert!(parse_tsize("-1").is_err());
        assert!(parse_tsize("big").is_err());
    }

    #[test]
    fn v4_mapped_peers_are_stripped_on_v6_servers() {
        let server: IpAddr = "::".parse().unwrap();
        let peer: SocketAddr = "[::ffff:192.0.2.7]:2001".parse().unwrap();
        assert_eq!(
            normalize_peer(server, peer),
            "192.0.2.7:2001".parse().unwrap()
        );

        // A native v6 peer is left alone, and a v4 socket never surfaces
        // mapped addresses in the first place.
        let peer6: SocketAddr = "[2001:db8::5]:69".parse().unwrap();
        assert_eq!(normalize_peer(server, peer6), peer6);
        let server4: IpAddr = "10.0.0.1".parse().unwrap();
        let peer4: SocketAddr = "192.0.2.7:2001".parse().unwrap();
        assert_eq!(normalize_peer(server4, peer4), peer4);
    }

    #[test]
    fn wire_peer_restores_the_mapped_form_on_v6_sockets() {
        let server: IpAddr = "::".parse().unwrap();
        let peer: SocketAddr = "192.0.2.7:2001".parse().unwrap();
        assert_eq!(
            wire_peer(server, peer),
            "[::ffff:192.0.2.7]:2001".parse().unwrap()
        );

        // Round trip: what the session identifies is what the socket
        // reaches.
        assert_eq!(normalize_peer(server, wire_peer(server, peer)), peer);

        let server4: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(wire_peer(server4, peer), peer);
    }

    #[test]
    fn blksize_hint_clamps_and_defaults() {
        let mut options = HashMap::new();
        assert_eq!(blksize_hint(&options), BLOCK_SIZE);
        options.insert("blksize".to_string(), "70000".to_string());
        assert_eq!(blksize_hint(&options), MAX_BLKSIZE);
        options.insert("blksize".to_string(), "notanumber".to_string());
        assert_eq!(blksize_hint(&options), BLOCK_SIZE);
        options.insert("blksize".to_string(), "1024".to_string());
        assert_eq!(blksize_hint(&options), 1024);
    }
}
