// The common buffer contract and shared socket machinery.
//
// Every endpoint role (server, client, relay) implements `Buffer`: drain
// both sockets without blocking, flush per-peer packets, queue outbound
// messages, and answer identity questions. The free functions below are the
// mechanical halves the roles share — nonblocking stream drains feeding a
// `PacketAssembler`, packet flushes through the transform pipeline, and the
// clock/header plumbing.
//
// Writes use a bounded retry on `WouldBlock`: outbound packets are small
// and the OS send buffer absorbs them in practice, so a peer that stays
// unwritable for the whole retry window is treated as dead rather than
// queued against.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::warn;

use alderwire_protocol::control::PingRequest;
use alderwire_protocol::packet::{Packet, PacketAssembler, PacketHeader};
use alderwire_protocol::transform::{
    BandwidthMeter, BandwidthStep, CompressionStep, Direction, TransformPipeline, TransformStep,
    PRIORITY_COMPRESSION, PRIORITY_INCOMING_BANDWIDTH, PRIORITY_OUTGOING_BANDWIDTH,
};
use alderwire_protocol::types::ClientId;

use crate::config::Config;
use crate::error::{Result, SessionError};
use crate::message::{OutboundMessage, SessionEvent};

use std::sync::Arc;

/// The contract every endpoint role implements. The connection façade (or
/// its worker thread) drives these in a fixed rhythm: service requests,
/// `receive`, `send`, sleep.
pub trait Buffer: Send {
    /// Perform deferred startup work: a no-op for servers and relays (their
    /// sockets bind at construction), the full admission handshake for
    /// clients. Returns any events produced along the way.
    fn open(&mut self) -> Result<Vec<SessionEvent>>;

    /// Drain both sockets without blocking and return the decoded batch,
    /// client events ordered before application RPCs.
    fn receive(&mut self) -> Result<Vec<SessionEvent>>;

    /// Flush every per-peer packet.
    fn send(&mut self) -> Result<()>;

    /// Queue an encoded message for the next `send`.
    fn enqueue(&mut self, message: OutboundMessage);

    /// Tear the endpoint down.
    fn disconnect_all(&mut self);

    /// Drop one client (server/relay only).
    fn disconnect_client(&mut self, id: ClientId) -> Result<()>;

    /// Move the authority role (relay only; host clients forward the
    /// request to their relay).
    fn migrate_host(&mut self, new_host: ClientId) -> Result<()>;

    /// Start a latency probe toward `target`. Self-pings resolve
    /// immediately without touching a socket.
    fn ping(&mut self, target: ClientId) -> PingRequest;

    fn local_id(&self) -> ClientId;

    fn authority(&self) -> ClientId;

    fn is_active(&self) -> bool;

    /// Bound (TCP, UDP) listen addresses of a server/relay; `None` on
    /// clients. Lets callers recover OS-assigned ports after binding
    /// port 0.
    fn local_addrs(&self) -> Option<(SocketAddr, SocketAddr)> {
        None
    }
}

/// One receive pass's output, split so client events can be delivered
/// before the application RPCs of the same batch.
#[derive(Default)]
pub(crate) struct Batch {
    pub control: Vec<SessionEvent>,
    pub rpc: Vec<SessionEvent>,
}

impl Batch {
    pub fn into_events(mut self) -> Vec<SessionEvent> {
        self.control.append(&mut self.rpc);
        self.control
    }
}

/// Milliseconds since the Unix epoch, as carried in packet headers and ping
/// timestamps.
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Header template for this endpoint's outbound packets; `total_len` and
/// the timestamp are filled at emit time.
pub(crate) fn base_header(config: &Config, sender: ClientId, secret: u32) -> PacketHeader {
    PacketHeader {
        protocol_version: config.protocol_version,
        app_version: config.app_version,
        timestamp_ms: 0,
        total_len: 0,
        sender_id: sender,
        sender_secret: secret,
        flags: 0,
    }
}

/// The version gate applied to every inbound packet.
pub(crate) fn version_ok(config: &Config, header: &PacketHeader) -> bool {
    header.protocol_version >= config.min_protocol_version
        && header.app_version >= config.min_app_version
}

/// Assemble the endpoint's transform pipeline: the reserved steps per the
/// configuration, then any user steps at their chosen priorities. A user
/// step that collides with a reserved priority is a configuration error.
pub(crate) fn build_pipeline(
    config: &Config,
    meter: &Arc<BandwidthMeter>,
    user_steps: Vec<(i32, Box<dyn TransformStep>)>,
) -> Result<TransformPipeline> {
    let mut pipeline = TransformPipeline::new();
    if config.measure_bandwidth {
        pipeline.insert(
            PRIORITY_INCOMING_BANDWIDTH,
            Box::new(BandwidthStep::new(Direction::Incoming, meter.clone())),
        )?;
        pipeline.insert(
            PRIORITY_OUTGOING_BANDWIDTH,
            Box::new(BandwidthStep::new(Direction::Outgoing, meter.clone())),
        )?;
    }
    pipeline.insert(
        PRIORITY_COMPRESSION,
        Box::new(CompressionStep::new(config.use_compression)),
    )?;
    for (priority, step) in user_steps {
        pipeline.insert(priority, step)?;
    }
    Ok(pipeline)
}

const WRITE_RETRY_INTERVAL: Duration = Duration::from_millis(1);
const WRITE_RETRY_LIMIT: u32 = 250;

/// Write all of `bytes` to a nonblocking stream, retrying briefly on a full
/// send buffer.
pub(crate) fn write_all_retrying(stream: &mut TcpStream, bytes: &[u8]) -> std::io::Result<()> {
    let mut written = 0;
    let mut retries = 0;
    while written < bytes.len() {
        match stream.write(&bytes[written..]) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(n) => {
                written += n;
                retries = 0;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                retries += 1;
                if retries > WRITE_RETRY_LIMIT {
                    return Err(ErrorKind::TimedOut.into());
                }
                std::thread::sleep(WRITE_RETRY_INTERVAL);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Flush a stream packet: emit fragment by fragment, apply the send
/// pipeline, and write. The packet ends up empty.
pub(crate) fn flush_stream(
    stream: &mut TcpStream,
    packet: &mut Packet,
    header: &mut PacketHeader,
    pipeline: &TransformPipeline,
) -> Result<()> {
    while packet.has_messages() {
        header.timestamp_ms = now_ms();
        let mut frame = packet.emit(header).to_vec();
        pipeline.apply_send(&mut frame)?;
        write_all_retrying(stream, &frame)?;
        let fragmented = packet.is_fragmented();
        packet.reset();
        if !fragmented {
            break;
        }
    }
    Ok(())
}

/// Flush a datagram packet. UDP never fragments: anything beyond the first
/// fragment is dropped with a warning.
pub(crate) fn flush_datagram(
    udp: &UdpSocket,
    addr: SocketAddr,
    packet: &mut Packet,
    header: &mut PacketHeader,
    pipeline: &TransformPipeline,
) -> Result<()> {
    if !packet.has_messages() {
        return Ok(());
    }
    header.timestamp_ms = now_ms();
    let mut frame = packet.emit(header).to_vec();
    if packet.is_fragmented() {
        warn!(to = %addr, "datagram overflow: deferred messages dropped");
    }
    packet.clear();
    pipeline.apply_send(&mut frame)?;
    match udp.send_to(&frame, addr) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::WouldBlock => {
            warn!(to = %addr, "datagram send buffer full, packet dropped");
            Ok(())
        }
        Err(e) => Err(SessionError::Io(e)),
    }
}

/// Drain a nonblocking stream into completed frames. Returns `true` when
/// the peer closed the connection. Framing errors propagate — the caller
/// drops the connection.
pub(crate) fn drain_stream(
    stream: &mut TcpStream,
    assembler: &mut PacketAssembler,
    frames: &mut Vec<Vec<u8>>,
) -> Result<bool> {
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return Ok(true),
            Ok(n) => {
                let mut offset = 0;
                while offset < n {
                    offset += assembler.ingest(&buf[offset..n])?;
                    if let Some(frame) = assembler.take_frame() {
                        frames.push(frame);
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(SessionError::Io(e)),
        }
    }
}

/// Drain every waiting datagram.
pub(crate) fn drain_datagrams(
    udp: &UdpSocket,
    out: &mut Vec<(SocketAddr, Vec<u8>)>,
) -> Result<()> {
    let mut buf = [0u8; 65_536];
    loop {
        match udp.recv_from(&mut buf) {
            Ok((n, src)) => out.push((src, buf[..n].to_vec())),
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(SessionError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alderwire_protocol::packet::iter_messages;
    use std::net::TcpListener;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let a = TcpStream::connect(addr).unwrap();
        let (b, _) = listener.accept().unwrap();
        (a, b)
    }

    #[test]
    fn flush_and_drain_roundtrip() {
        let (mut tx, mut rx) = pair();
        rx.set_nonblocking(true).unwrap();

        let config = Config::default();
        let pipeline = build_pipeline(&config, &BandwidthMeter::new(), Vec::new()).unwrap();
        let mut packet = Packet::outbound(config.buffer_size);
        packet.push_message(b"first");
        packet.push_message(b"second");
        let mut header = base_header(&config, ClientId(3), 99);
        flush_stream(&mut tx, &mut packet, &mut header, &pipeline).unwrap();
        assert!(!packet.has_messages());

        // Drain until the frame arrives.
        let mut assembler = PacketAssembler::new();
        let mut frames = Vec::new();
        for _ in 0..100 {
            let closed = drain_stream(&mut rx, &mut assembler, &mut frames).unwrap();
            assert!(!closed);
            if !frames.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(frames.len(), 1);
        let mut frame = frames.pop().unwrap();
        pipeline.apply_receive(&mut frame).unwrap();
        let header = PacketHeader::parse(&frame).unwrap();
        assert_eq!(header.sender_id, ClientId(3));
        assert_eq!(header.sender_secret, 99);
        assert_eq!(header.total_len as usize, frame.len());
        let messages: Vec<_> = iter_messages(&frame).map(|m| m.unwrap().to_vec()).collect();
        assert_eq!(messages, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn drain_reports_peer_close() {
        let (tx, mut rx) = pair();
        rx.set_nonblocking(true).unwrap();
        drop(tx);

        let mut assembler = PacketAssembler::new();
        let mut frames = Vec::new();
        for _ in 0..100 {
            match drain_stream(&mut rx, &mut assembler, &mut frames) {
                Ok(true) => return,
                Ok(false) => std::thread::sleep(Duration::from_millis(5)),
                Err(e) => panic!("unexpected error {e}"),
            }
        }
        panic!("close was never observed");
    }

    #[test]
    fn version_gate() {
        let mut config = Config::default();
        config.protocol_version = 3;
        config.min_protocol_version = 2;
        let mut header = base_header(&config, ClientId::NONE, 0);
        assert!(version_ok(&config, &header));
        header.protocol_version = 1;
        assert!(!version_ok(&config, &header));
        header.protocol_version = 2;
        header.app_version = 0;
        assert!(!version_ok(&config, &header));
    }
}
